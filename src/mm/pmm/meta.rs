//! # Frame Meta
//!
//! Metadados de um frame físico. Uma entrada por frame, em storage fornecido
//! pelo kernel no boot. Além do refcount (COW) e das flags, cada entrada
//! carrega o encadeamento das free lists do Buddy por índice de frame, sem
//! ponteiros para dentro de memória livre.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Índice nulo nas free lists encadeadas por frame
pub const FRAME_NIL: u32 = u32::MAX;

/// Marcador "sem ordem": o frame não é cabeça de bloco (nem livre, nem alocado)
pub const ORDER_NONE: u8 = u8::MAX;

bitflags! {
    /// Flags de um frame físico
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        const DIRTY    = 1 << 0;
        const ACCESSED = 1 << 1;
        const LOCKED   = 1 << 2;
        const RESERVED = 1 << 3;
    }
}

/// Metadados de um frame físico.
///
/// `order` só é significativo na cabeça de um bloco: guarda a ordem do bloco
/// livre (enquanto estiver numa free list) ou a ordem com que o bloco foi
/// alocado (para validar o free correspondente). `ORDER_NONE` em todos os
/// outros frames.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FrameMeta {
    /// Contagem de referências (COW): 0 = livre, >0 = alocado/compartilhado
    pub(crate) ref_count: u32,
    /// Flags do frame
    pub(crate) flags: FrameFlags,
    /// Ordem do bloco quando este frame é cabeça de bloco
    pub(crate) order: u8,
    _pad: u8,
    /// Próximo frame na free list da mesma ordem (FRAME_NIL = fim)
    pub(crate) next_free: u32,
    /// Payload opcional do dono (ex: cache Slab que usa o frame)
    pub(crate) owner: u64,
}

impl FrameMeta {
    pub const fn new() -> Self {
        Self {
            ref_count: 0,
            flags: FrameFlags::empty(),
            order: ORDER_NONE,
            _pad: 0,
            next_free: FRAME_NIL,
            owner: 0,
        }
    }

    /// Volta ao estado de frame livre recém-criado.
    pub(crate) fn reset(&mut self) {
        self.ref_count = 0;
        self.flags = FrameFlags::empty();
        self.order = ORDER_NONE;
        self.next_free = FRAME_NIL;
        self.owner = 0;
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::new()
    }
}

// Uma entrada por frame: 24 bytes (0,6% de overhead por página de 4 KiB)
const_assert_eq!(core::mem::size_of::<FrameMeta>(), 24);
