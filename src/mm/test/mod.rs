//! # Testes do Subsistema MM
//!
//! Suites executáveis dentro do kernel (feature `self_test`), no estilo do
//! framework da klib. Todas operam sobre o contexto global já inicializado
//! pelo boot e deixam o estado como encontraram.
//!
//! Sob `cargo test`, o harness em `harness` inicializa o contexto global
//! sobre uma arena de processo e roda as mesmas suites.

pub mod frame_test;

use crate::klib::test_framework::run_test_suite;

/// Roda todas as suites do MM. Retorna (passed, failed, skipped).
pub fn run_all() -> (usize, usize, usize) {
    let suites = [
        ("PMM", frame_test::FRAME_TESTS),
        ("Buddy", buddy_test::BUDDY_TESTS),
        ("Slab", slab_test::SLAB_TESTS),
        ("NUMA", numa_test::NUMA_TESTS),
    ];

    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for (name, suite) in suites {
        let (p, f, s) = run_test_suite(name, suite);
        passed += p;
        failed += f;
        skipped += s;
    }
    (passed, failed, skipped)
}

// =============================================================================
// SUPORTE PARA TESTES DE HOST (cargo test)
// =============================================================================

#[cfg(test)]
pub(crate) mod support {
    use crate::mm::addr::PhysAddr;
    use crate::mm::buddy::BuddyAllocator;
    use crate::mm::config::PAGE_SIZE;
    use crate::mm::pmm::{FrameMeta, FrameStorage, FrameTable};

    /// Storage de bookkeeping vazado no heap do processo de teste.
    pub(crate) fn leaked_storage(frames: usize) -> FrameStorage {
        let meta = vec![FrameMeta::new(); frames].leak();
        let bitmap = vec![0u64; FrameStorage::bitmap_words(frames)].leak();
        FrameStorage { meta, bitmap }
    }

    /// Tabela de frames sobre endereços sintéticos (nenhum acesso à RAM).
    pub(crate) fn leaked_table(base: u64, frames: usize) -> FrameTable {
        FrameTable::new(PhysAddr::new(base), frames, leaked_storage(frames)).unwrap()
    }

    /// Contexto Buddy com a região inteira já liberada.
    pub(crate) fn context(base: u64, bytes: usize) -> BuddyAllocator {
        let mut allocator = BuddyAllocator::new(leaked_table(base, bytes / PAGE_SIZE));
        allocator
            .free_region(PhysAddr::new(base), bytes as u64)
            .unwrap();
        allocator
    }

    /// Arena real (memória de verdade) para testes que escrevem nos frames,
    /// como os de Slab. Alinhada a página, nunca devolvida.
    pub(crate) fn leaked_arena(bytes: usize) -> u64 {
        let layout = std::alloc::Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
        // SAFETY: layout válido e não-nulo; a arena vive até o fim do processo
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        ptr as u64
    }

    /// Inicializa o contexto GLOBAL uma única vez por processo de teste,
    /// sobre uma arena real (os testes de Slab escrevem nos frames).
    pub(crate) fn bootstrap_global() {
        static BOOT: std::sync::Once = std::sync::Once::new();
        BOOT.call_once(|| {
            let bytes: usize = 32 * 1024 * 1024;
            let base = leaked_arena(bytes);
            let frames = bytes / PAGE_SIZE;
            crate::mm::init(PhysAddr::new(base), bytes as u64, leaked_storage(frames)).unwrap();
            crate::mm::pmm::free_region(PhysAddr::new(base), bytes as u64).unwrap();
            crate::mm::numa::init(16, bytes as u64).unwrap();
        });
    }
}

#[cfg(test)]
mod harness {
    // Único teste de host que toca o contexto global: roda as suites
    // inteiras em sequência, como o kernel faria no boot.
    #[test]
    fn mm_self_test() {
        super::support::bootstrap_global();
        let (passed, failed, _skipped) = super::run_all();
        assert!(passed > 0);
        assert_eq!(failed, 0);
    }
}
