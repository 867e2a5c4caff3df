//! # Memory Management Subsystem (MM)
//!
//! Hierarquia de alocadores de memória física do Magma Kernel.
//!
//! ## 🎯 Propósito e Responsabilidade
//! - **Fonte única de verdade:** um bitmap + uma tabela de metadados por
//!   frame, compartilhados entre FrameTable e Buddy (nada de alocadores
//!   paralelos com estado duplicado).
//! - **Segurança de Concorrência:** um lock busy-wait por alocador,
//!   adquirido em volta da operação inteira.
//! - **Interface Pública:** páginas (`pmm`), blocos por ordem (`buddy`),
//!   objetos (`slab`) e dica de nó (`numa`).
//!
//! ## 🏗️ Arquitetura dos Módulos
//!
//! | Módulo  | Responsabilidade | Observações |
//! |---------|------------------|-------------|
//! | `pmm`   | FrameTable: bitmap + refcount/flags por frame. | Scan linear só como fallback. |
//! | `buddy` | Blocos potência de 2, split/coalesce por XOR. | Free lists por índice nos metadados. |
//! | `slab`  | Objetos de tamanho fixo sobre o Buddy. | Listas empty/partial/full por cache. |
//! | `numa`  | Topologia sintética + alocação advisory. | Dica, nunca garantia de placement. |
//!
//! ## 🔒 Locking
//!
//! Todos os locks são spinlocks (busy-wait): nenhuma operação de alocação
//! dorme, o que mantém o subsistema utilizável em contexto de interrupção
//! e no early-boot. Ordem global de aquisição (deadlock prevention):
//!
//! ```text
//! PHYS_ALLOCATOR (contexto físico)
//!   └─> SlabCache.inner (cache individual)
//! REGISTRY (criação de caches)
//!   └─> SlabCache.inner
//! TOPOLOGY (NUMA) nunca é adquirido junto com os demais
//! ```
//!
//! ## Ciclo de vida
//!
//! `init` roda UMA vez no boot com o storage de bookkeeping carved pelo
//! kernel. Todos os frames nascem ocupados; o boot libera as regiões
//! usable do memory map com `pmm::free_region` e reserva kernel/MMIO com
//! `pmm::reserve_region`. Não existe teardown nem re-init.

pub mod addr;
pub mod buddy;
pub mod config;
pub mod error;
pub mod numa;
pub mod pmm;
pub mod slab;
pub mod stats;

#[cfg(any(test, feature = "self_test"))]
pub mod test;

pub use addr::PhysAddr;
pub use buddy::BuddyAllocator;
pub use error::{MmError, MmResult};
pub use pmm::{FrameFlags, FrameStorage, FrameTable};

use crate::mm::config::PAGE_SIZE;
use spin::Mutex;

/// Contexto físico global: FrameTable + Buddy sob um único lock.
///
/// `None` até o boot chamar `init`. Um lock para a operação inteira.
pub(crate) static PHYS_ALLOCATOR: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

/// Executa `f` com o contexto físico global travado.
pub(crate) fn with_allocator<R>(
    f: impl FnOnce(&mut BuddyAllocator) -> MmResult<R>,
) -> MmResult<R> {
    let mut guard = PHYS_ALLOCATOR.lock();
    match guard.as_mut() {
        Some(allocator) => f(allocator),
        None => Err(MmError::NotInitialized),
    }
}

/// O contexto físico global já foi inicializado?
pub fn is_initialized() -> bool {
    PHYS_ALLOCATOR.lock().is_some()
}

/// Inicializa o contexto físico global sobre `[base, base + size)`.
///
/// Todos os frames começam ocupados; use `pmm::free_region` para liberar
/// as regiões usable do memory map. O storage de bookkeeping vem do caller
/// e não consome frames da região gerenciada.
///
/// Re-inicialização é rejeitada com `InitFailed`.
pub fn init(base: PhysAddr, size: u64, storage: FrameStorage) -> MmResult<()> {
    let total_frames = (size / PAGE_SIZE as u64) as usize;

    let mut guard = PHYS_ALLOCATOR.lock();
    if guard.is_some() {
        crate::kerror!("(MM) init duplicado rejeitado");
        return Err(MmError::InitFailed);
    }

    let table = FrameTable::new(base, total_frames, storage)?;
    *guard = Some(BuddyAllocator::new(table));
    drop(guard);

    stats::refresh();
    crate::kinfo!("(MM) contexto físico pronto. frames=", total_frames);
    Ok(())
}
