//! # Memory Statistics
//!
//! Contadores globais do subsistema, espelhados do contexto físico para
//! leitura sem lock (telemetria, painel de boot). A fonte autoritativa é
//! sempre o contexto; `refresh` copia com `try_lock` para nunca contender
//! com o caminho de alocação.

use core::sync::atomic::{AtomicU64, Ordering};

pub static TOTAL_FRAMES: AtomicU64 = AtomicU64::new(0);
pub static USED_FRAMES: AtomicU64 = AtomicU64::new(0);
pub static FAILED_ALLOCS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_frames: u64,
    pub used_frames: u64,
    pub free_frames: u64,
    pub failed_allocs: u64,
}

impl MemoryStats {
    pub fn usage_percent(&self) -> u64 {
        if self.total_frames == 0 {
            return 0;
        }
        (self.used_frames * 100) / self.total_frames
    }
}

/// Lê o último espelho publicado (não trava nada).
pub fn snapshot() -> MemoryStats {
    let total = TOTAL_FRAMES.load(Ordering::Relaxed);
    let used = USED_FRAMES.load(Ordering::Relaxed);
    MemoryStats {
        total_frames: total,
        used_frames: used,
        free_frames: total.saturating_sub(used),
        failed_allocs: FAILED_ALLOCS.load(Ordering::Relaxed),
    }
}

/// Atualiza o espelho a partir do contexto físico, se o lock estiver livre.
pub fn refresh() {
    if let Some(guard) = crate::mm::PHYS_ALLOCATOR.try_lock() {
        if let Some(allocator) = guard.as_ref() {
            let table = allocator.table();
            TOTAL_FRAMES.store(table.total_frames() as u64, Ordering::Relaxed);
            USED_FRAMES.store(table.used_frames() as u64, Ordering::Relaxed);
            FAILED_ALLOCS.store(
                table.stats().failed_allocs.load(Ordering::Relaxed) as u64,
                Ordering::Relaxed,
            );
        }
    }
}
