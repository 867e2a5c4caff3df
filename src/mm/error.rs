//! Tipos de Erro do Subsistema de Memória
//!
//! Define erros estruturados para diagnóstico preciso de falhas em MM.
//! Nenhuma primitiva de alocação faz panic: toda falha é um retorno.

/// Erros do subsistema de memória
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Sem memória física disponível (OOM)
    OutOfMemory,
    /// Parâmetro inválido (ordem acima do máximo, tamanho zero, etc)
    InvalidParameter,
    /// Índice de frame além do total gerenciado
    OutOfBounds,
    /// Endereço não alinhado ao limite exigido pela operação
    NotAligned,
    /// Endereço não pertence a nenhuma região/slab conhecido
    InvalidAddress,
    /// Double free detectado
    DoubleFree,
    /// Falha na inicialização (ou re-inicialização rejeitada)
    InitFailed,
    /// Subsistema ainda não inicializado
    NotInitialized,
}

impl MmError {
    /// Retorna descrição legível do erro
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "OOM: sem frames físicos disponíveis",
            Self::InvalidParameter => "Parâmetro inválido",
            Self::OutOfBounds => "Índice de frame fora dos limites",
            Self::NotAligned => "Endereço não alinhado",
            Self::InvalidAddress => "Endereço inválido",
            Self::DoubleFree => "Double free detectado",
            Self::InitFailed => "Falha na inicialização",
            Self::NotInitialized => "Subsistema não inicializado",
        }
    }
}

impl core::fmt::Display for MmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tipo Result específico para operações de memória
pub type MmResult<T> = Result<T, MmError>;
