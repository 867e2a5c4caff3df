//! # PMM - Physical Memory Manager
//!
//! FrameTable: a fonte única de verdade sobre o estado dos frames físicos.
//!
//! Um bit por frame no bitmap (1 = ocupado) e uma entrada de metadados por
//! frame (refcount para COW, flags, encadeamento das free lists do Buddy).
//! O storage do bitmap e dos metadados é fornecido pelo kernel no boot; a
//! tabela nunca consome frames da própria região que gerencia.
//!
//! A API pública de páginas (`alloc_page`, `free_page`, `ref_page`, ...)
//! opera sobre o contexto global e é servida pelo Buddy por baixo. O scan
//! linear first-fit sobrevive apenas como fallback de `alloc_pages` quando
//! não existe bloco potência de 2 alinhado disponível.

pub mod meta;

pub use meta::{FrameFlags, FrameMeta, FRAME_NIL, ORDER_NONE};

use crate::klib::bitmap::Bitmap;
use crate::mm::addr::PhysAddr;
use crate::mm::config::PAGE_SIZE;
use crate::mm::error::{MmError, MmResult};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Estatísticas por tabela de frames
#[derive(Debug, Default)]
pub struct PmmStats {
    pub total_frames: usize,
    pub used_frames: AtomicUsize,
    pub failed_allocs: AtomicUsize,
}

impl PmmStats {
    pub const fn new() -> Self {
        Self {
            total_frames: 0,
            used_frames: AtomicUsize::new(0),
            failed_allocs: AtomicUsize::new(0),
        }
    }

    pub fn inc_failed(&self) {
        self.failed_allocs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Storage de bookkeeping fornecido pelo kernel hospedeiro.
///
/// Dimensionamento: `meta.len() >= frames` e
/// `bitmap.len() >= FrameStorage::bitmap_words(frames)`.
pub struct FrameStorage {
    pub meta: &'static mut [FrameMeta],
    pub bitmap: &'static mut [u64],
}

impl FrameStorage {
    /// Palavras u64 de bitmap necessárias para `frames` frames.
    pub const fn bitmap_words(frames: usize) -> usize {
        crate::klib::bitmap::words_for(frames)
    }
}

/// Tabela de frames físicos.
///
/// Todos os frames começam OCUPADOS. O boot libera as regiões usable com
/// `free_region`, espelhando o fluxo de memory map do bootloader.
pub struct FrameTable {
    meta: &'static mut [FrameMeta],
    bitmap: Bitmap<'static>,
    base: PhysAddr,
    stats: PmmStats,
    /// Dica de palavra do bitmap para o scan linear (rotativa)
    next_free: usize,
}

impl FrameTable {
    pub fn new(base: PhysAddr, total_frames: usize, storage: FrameStorage) -> MmResult<Self> {
        if total_frames == 0 || total_frames >= FRAME_NIL as usize {
            return Err(MmError::InvalidParameter);
        }
        if !base.is_aligned(PAGE_SIZE as u64) {
            return Err(MmError::NotAligned);
        }
        if storage.meta.len() < total_frames
            || storage.bitmap.len() < FrameStorage::bitmap_words(total_frames)
        {
            crate::kerror!("(PMM) storage insuficiente para frames=", total_frames);
            return Err(MmError::InvalidParameter);
        }

        let meta = storage.meta;
        for entry in meta.iter_mut().take(total_frames) {
            entry.reset();
        }

        let mut bitmap = Bitmap::new(storage.bitmap, total_frames);
        bitmap.set_all(); // tudo ocupado até o boot liberar as regiões usable

        let stats = PmmStats {
            total_frames,
            used_frames: AtomicUsize::new(total_frames),
            failed_allocs: AtomicUsize::new(0),
        };

        crate::kinfo!("(PMM) FrameTable criada. frames=", total_frames);
        Ok(Self {
            meta,
            bitmap,
            base,
            stats,
            next_free: 0,
        })
    }

    // =========================================================================
    // CONSULTAS
    // =========================================================================

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn total_frames(&self) -> usize {
        self.stats.total_frames
    }

    #[inline]
    pub fn used_frames(&self) -> usize {
        self.stats.used_frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn free_frames(&self) -> usize {
        self.total_frames() - self.used_frames()
    }

    pub fn stats(&self) -> &PmmStats {
        &self.stats
    }

    /// Índice do frame que contém `addr`. Erro duro se estiver fora da tabela.
    pub fn index_of(&self, addr: PhysAddr) -> MmResult<usize> {
        if addr.as_u64() < self.base.as_u64() {
            return Err(MmError::OutOfBounds);
        }
        let idx = ((addr.as_u64() - self.base.as_u64()) / PAGE_SIZE as u64) as usize;
        if idx >= self.total_frames() {
            return Err(MmError::OutOfBounds);
        }
        Ok(idx)
    }

    /// Endereço inicial do frame `idx`.
    #[inline]
    pub fn addr_of(&self, idx: usize) -> PhysAddr {
        self.base.add((idx * PAGE_SIZE) as u64)
    }

    /// Page frame number absoluto do frame `idx`.
    #[inline]
    pub(crate) fn abs_pfn(&self, idx: usize) -> u64 {
        self.base.pfn() + idx as u64
    }

    #[inline]
    pub fn is_free(&self, idx: usize) -> bool {
        !self.bitmap.test(idx)
    }

    // =========================================================================
    // TRANSIÇÕES DE ESTADO (uso interno do Buddy)
    // =========================================================================

    pub(crate) fn mark_range_used(&mut self, start: usize, count: usize) {
        for idx in start..start + count {
            debug_assert!(self.is_free(idx));
            self.bitmap.set(idx);
            self.meta[idx].order = ORDER_NONE;
        }
        self.stats.used_frames.fetch_add(count, Ordering::Relaxed);
        self.next_free = start / 64;
    }

    pub(crate) fn mark_range_free(&mut self, start: usize, count: usize) {
        for idx in start..start + count {
            debug_assert!(!self.is_free(idx));
            self.bitmap.clear(idx);
            self.meta[idx].reset();
        }
        self.stats.used_frames.fetch_sub(count, Ordering::Relaxed);
        if start / 64 < self.next_free {
            self.next_free = start / 64;
        }
    }

    /// Scan linear first-fit por `n` frames livres contíguos. O(total).
    pub(crate) fn find_free_run(&self, n: usize) -> Option<usize> {
        if n == 1 {
            return self.bitmap.find_first_zero_from(self.next_free);
        }
        self.bitmap.find_zero_run(n)
    }

    #[inline]
    pub(crate) fn meta(&self, idx: usize) -> &FrameMeta {
        &self.meta[idx]
    }

    #[inline]
    pub(crate) fn meta_mut(&mut self, idx: usize) -> &mut FrameMeta {
        &mut self.meta[idx]
    }

    // =========================================================================
    // METADADOS POR FRAME (refcount / flags / owner)
    // =========================================================================

    /// Incrementa o refcount de uma página alocada (compartilhamento COW).
    pub fn ref_page(&mut self, addr: PhysAddr) -> MmResult<u32> {
        let idx = self.index_of(addr)?;
        if self.is_free(idx) {
            return Err(MmError::InvalidAddress);
        }
        let meta = &mut self.meta[idx];
        meta.ref_count = meta.ref_count.saturating_add(1);
        Ok(meta.ref_count)
    }

    pub fn get_refcount(&self, addr: PhysAddr) -> MmResult<u32> {
        let idx = self.index_of(addr)?;
        Ok(self.meta[idx].ref_count)
    }

    pub fn get_page_flags(&self, addr: PhysAddr) -> MmResult<FrameFlags> {
        let idx = self.index_of(addr)?;
        Ok(self.meta[idx].flags)
    }

    pub fn set_page_flags(&mut self, addr: PhysAddr, flags: FrameFlags) -> MmResult<()> {
        let idx = self.index_of(addr)?;
        self.meta[idx].flags.insert(flags);
        Ok(())
    }

    pub fn clear_page_flags(&mut self, addr: PhysAddr, flags: FrameFlags) -> MmResult<()> {
        let idx = self.index_of(addr)?;
        self.meta[idx].flags.remove(flags);
        Ok(())
    }

    pub fn set_owner(&mut self, addr: PhysAddr, owner: u64) -> MmResult<()> {
        let idx = self.index_of(addr)?;
        self.meta[idx].owner = owner;
        Ok(())
    }

    pub fn owner(&self, addr: PhysAddr) -> MmResult<u64> {
        let idx = self.index_of(addr)?;
        Ok(self.meta[idx].owner)
    }
}

// =============================================================================
// API GLOBAL DE PÁGINAS (contexto único de boot)
// =============================================================================

use crate::mm::with_allocator;

/// Aloca uma página física (refcount inicia em 1).
pub fn alloc_page() -> MmResult<PhysAddr> {
    with_allocator(|a| a.alloc_page())
}

/// Aloca `n` páginas físicas contíguas.
pub fn alloc_pages(n: usize) -> MmResult<PhysAddr> {
    with_allocator(|a| a.alloc_pages(n))
}

/// Decrementa o refcount; libera o frame apenas quando chega a 0 (COW).
pub fn free_page(addr: PhysAddr) -> MmResult<()> {
    with_allocator(|a| a.free_page(addr))
}

/// Libera `n` páginas contíguas alocadas com `alloc_pages`.
pub fn free_pages(addr: PhysAddr, n: usize) -> MmResult<()> {
    with_allocator(|a| a.free_pages(addr, n))
}

/// Incrementa o refcount de uma página (compartilhamento COW).
pub fn ref_page(addr: PhysAddr) -> MmResult<u32> {
    with_allocator(|a| a.table_mut().ref_page(addr))
}

pub fn get_refcount(addr: PhysAddr) -> MmResult<u32> {
    with_allocator(|a| a.table().get_refcount(addr))
}

pub fn get_page_flags(addr: PhysAddr) -> MmResult<FrameFlags> {
    with_allocator(|a| a.table().get_page_flags(addr))
}

pub fn set_page_flags(addr: PhysAddr, flags: FrameFlags) -> MmResult<()> {
    with_allocator(|a| a.table_mut().set_page_flags(addr, flags))
}

pub fn clear_page_flags(addr: PhysAddr, flags: FrameFlags) -> MmResult<()> {
    with_allocator(|a| a.table_mut().clear_page_flags(addr, flags))
}

/// Reserva uma faixa de endereços (boot: kernel, MMIO, tabelas do loader).
pub fn reserve_region(base: PhysAddr, size: u64) -> MmResult<()> {
    with_allocator(|a| a.reserve_region(base, size))
}

/// Devolve uma faixa de endereços ao pool de frames livres.
pub fn free_region(base: PhysAddr, size: u64) -> MmResult<()> {
    with_allocator(|a| a.free_region(base, size))
}

/// Retorna (total, usados, livres) em frames.
pub fn get_stats() -> MmResult<(u64, u64, u64)> {
    with_allocator(|a| {
        let t = a.table();
        Ok((
            t.total_frames() as u64,
            t.used_frames() as u64,
            t.free_frames() as u64,
        ))
    })
}
