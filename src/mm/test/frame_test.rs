//! Testes do PMM (FrameTable + API de páginas)

use crate::klib::test_framework::{TestCase, TestResult};
use crate::mm::addr::PhysAddr;
use crate::mm::config::PAGE_SIZE;
use crate::mm::pmm;
use crate::mm::pmm::FrameFlags;

pub const FRAME_TESTS: &[TestCase] = &[
    TestCase::new("pmm_alloc_dealloc", test_alloc_dealloc),
    TestCase::new("pmm_frame_alignment", test_frame_alignment),
    TestCase::new("pmm_stats_invariant", test_stats_invariant),
    TestCase::new("pmm_refcount_gates_free", test_refcount_gates_free),
    TestCase::new("pmm_region_bounds_hard_error", test_region_bounds_hard_error),
    TestCase::new("pmm_page_flags", test_page_flags),
];

/// Teste básico: alocar e desalocar páginas devolve as estatísticas ao
/// ponto de partida.
fn test_alloc_dealloc() -> TestResult {
    let before = match pmm::get_stats() {
        Ok(s) => s,
        Err(_) => return TestResult::Failed,
    };

    let mut pages = [PhysAddr::zero(); 10];
    let mut i = 0;
    while i < 10 {
        match pmm::alloc_page() {
            Ok(addr) => pages[i] = addr,
            Err(_) => {
                crate::kerror!("(PMM) OOM ao alocar página índice=", i);
                return TestResult::Failed;
            }
        }
        i += 1;
    }

    let mut j = 0;
    while j < 10 {
        if pmm::free_page(pages[j]).is_err() {
            return TestResult::Failed;
        }
        j += 1;
    }

    let after = match pmm::get_stats() {
        Ok(s) => s,
        Err(_) => return TestResult::Failed,
    };
    if before != after {
        crate::kerror!("(PMM) estatísticas não voltaram. used=", after.1);
        return TestResult::Failed;
    }
    TestResult::Passed
}

/// Toda página entregue é alinhada a PAGE_SIZE.
fn test_frame_alignment() -> TestResult {
    let mut i = 0;
    while i < 5 {
        match pmm::alloc_page() {
            Ok(addr) => {
                if !addr.is_aligned(PAGE_SIZE as u64) {
                    crate::kerror!("(PMM) página desalinhada em=", addr.as_u64());
                    return TestResult::Failed;
                }
                if pmm::free_page(addr).is_err() {
                    return TestResult::Failed;
                }
            }
            Err(_) => return TestResult::Failed,
        }
        i += 1;
    }
    TestResult::Passed
}

/// total == usados + livres em qualquer ponto de observação.
fn test_stats_invariant() -> TestResult {
    let (total, used, free) = match pmm::get_stats() {
        Ok(s) => s,
        Err(_) => return TestResult::Failed,
    };
    if total != used + free {
        crate::kerror!("(PMM) invariante quebrado. total=", total);
        return TestResult::Failed;
    }
    TestResult::Passed
}

/// free_page só devolve o frame ao pool na queda da última referência.
fn test_refcount_gates_free() -> TestResult {
    let (_, used0, _) = match pmm::get_stats() {
        Ok(s) => s,
        Err(_) => return TestResult::Failed,
    };

    let page = match pmm::alloc_page() {
        Ok(p) => p,
        Err(_) => return TestResult::Failed,
    };
    // refcount 1 -> 3
    if pmm::ref_page(page) != Ok(2) || pmm::ref_page(page) != Ok(3) {
        return TestResult::Failed;
    }

    // Duas quedas não liberam
    if pmm::free_page(page).is_err() || pmm::free_page(page).is_err() {
        return TestResult::Failed;
    }
    match pmm::get_stats() {
        Ok((_, used, _)) if used == used0 + 1 => {}
        _ => {
            crate::kerror!("(PMM) frame liberado cedo demais");
            return TestResult::Failed;
        }
    }
    if pmm::get_refcount(page) != Ok(1) {
        return TestResult::Failed;
    }

    // Última queda libera
    if pmm::free_page(page).is_err() {
        return TestResult::Failed;
    }
    match pmm::get_stats() {
        Ok((_, used, _)) if used == used0 => TestResult::Passed,
        _ => TestResult::Failed,
    }
}

/// Região fora da tabela é erro duro, não clamp silencioso.
fn test_region_bounds_hard_error() -> TestResult {
    let (total, _, _) = match pmm::get_stats() {
        Ok(s) => s,
        Err(_) => return TestResult::Failed,
    };
    let beyond = PhysAddr::new((total + 10) * PAGE_SIZE as u64 * 4);
    if pmm::reserve_region(beyond, PAGE_SIZE as u64).is_ok() {
        return TestResult::Failed;
    }
    if pmm::free_region(beyond, PAGE_SIZE as u64).is_ok() {
        return TestResult::Failed;
    }
    TestResult::Passed
}

/// Set/get/clear de flags por página.
fn test_page_flags() -> TestResult {
    let page = match pmm::alloc_page() {
        Ok(p) => p,
        Err(_) => return TestResult::Failed,
    };

    let wanted = FrameFlags::DIRTY | FrameFlags::ACCESSED;
    if pmm::set_page_flags(page, wanted).is_err() {
        return TestResult::Failed;
    }
    match pmm::get_page_flags(page) {
        Ok(flags) if flags.contains(wanted) => {}
        _ => return TestResult::Failed,
    }
    if pmm::clear_page_flags(page, FrameFlags::DIRTY).is_err() {
        return TestResult::Failed;
    }
    match pmm::get_page_flags(page) {
        Ok(flags) if !flags.contains(FrameFlags::DIRTY) && flags.contains(FrameFlags::ACCESSED) => {
        }
        _ => return TestResult::Failed,
    }

    if pmm::free_page(page).is_err() {
        return TestResult::Failed;
    }
    TestResult::Passed
}
