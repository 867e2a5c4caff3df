//! # Buddy Allocator
//!
//! Alocador de blocos contíguos em potências de 2 (ordem 0 = 1 página,
//! ordem k = 2^k páginas), construído diretamente sobre a FrameTable.
//!
//! ## 🎯 Estado unificado
//!
//! Não existe bitmap próprio do Buddy: o bitmap da FrameTable é a única
//! fonte de verdade de ocupação, e as free lists são encadeadas por índice
//! de frame dentro do array de metadados (`FrameMeta::next_free`). Nenhum
//! ponteiro é gravado em memória livre.
//!
//! ## 🏗️ Algoritmo
//!
//! - `alloc(ordem)`: sobe até a primeira free list populada, remove a
//!   cabeça e divide o bloco ao meio repetidamente, devolvendo cada metade
//!   superior à free list da ordem menor.
//! - `free(addr, ordem)`: marca o bloco livre e funde com o buddy enquanto
//!   ele estiver livre e com a mesma ordem. O buddy é encontrado por XOR no
//!   page frame number absoluto: `pfn ^ (1 << ordem)`.
//! - `free_region`: devolve frame a frame em ordem 0; a coalescência
//!   reconstrói os blocos máximos alinhados automaticamente.
//! - `reserve_region`: remove frames específicos de dentro de blocos livres
//!   descendo por splits (necessário para reservas de boot).
//!
//! ## Invariantes
//!
//! - Um bloco de ordem k está numa free list sse as duas metades de ordem
//!   k-1 estão individualmente livres e contíguas (mantido por construção).
//! - `total == used + free` após toda operação visível.
//! - `meta.order` na cabeça: ordem do bloco livre (em lista) ou ordem com
//!   que o bloco foi alocado; `ORDER_NONE` nos demais frames.

use crate::mm::addr::PhysAddr;
use crate::mm::config::{BUDDY_MAX_ORDER, PAGE_SIZE};
use crate::mm::error::{MmError, MmResult};
use crate::mm::pmm::{FrameFlags, FrameTable, FRAME_NIL, ORDER_NONE};

/// Calcula a ordem mínima cujo bloco comporta `size` bytes.
///
/// `ceil(log2(size / PAGE_SIZE))`; tamanhos até uma página dão ordem 0.
pub fn order_of(size: usize) -> usize {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let mut order = 0;
    while (1usize << order) < pages {
        order += 1;
    }
    order
}

/// Alocador Buddy sobre uma FrameTable.
pub struct BuddyAllocator {
    table: FrameTable,
    /// Cabeça da free list de cada ordem (índice de frame, FRAME_NIL = vazia)
    free_lists: [u32; BUDDY_MAX_ORDER + 1],
    /// Número de blocos livres por ordem
    free_blocks: [usize; BUDDY_MAX_ORDER + 1],
}

impl BuddyAllocator {
    pub fn new(table: FrameTable) -> Self {
        Self {
            table,
            free_lists: [FRAME_NIL; BUDDY_MAX_ORDER + 1],
            free_blocks: [0; BUDDY_MAX_ORDER + 1],
        }
    }

    #[inline]
    pub fn table(&self) -> &FrameTable {
        &self.table
    }

    #[inline]
    pub fn table_mut(&mut self) -> &mut FrameTable {
        &mut self.table
    }

    /// Número de blocos livres na free list da ordem dada.
    pub fn free_blocks_of(&self, order: usize) -> usize {
        if order > BUDDY_MAX_ORDER {
            return 0;
        }
        self.free_blocks[order]
    }

    // =========================================================================
    // FREE LISTS (encadeadas por índice no array de metadados)
    // =========================================================================

    fn push_block(&mut self, idx: usize, order: usize) {
        let head = self.free_lists[order];
        let meta = self.table.meta_mut(idx);
        meta.order = order as u8;
        meta.next_free = head;
        self.free_lists[order] = idx as u32;
        self.free_blocks[order] += 1;
    }

    fn pop_block(&mut self, order: usize) -> Option<usize> {
        let head = self.free_lists[order];
        if head == FRAME_NIL {
            return None;
        }
        let idx = head as usize;
        let meta = self.table.meta_mut(idx);
        self.free_lists[order] = meta.next_free;
        meta.next_free = FRAME_NIL;
        meta.order = ORDER_NONE;
        self.free_blocks[order] -= 1;
        Some(idx)
    }

    /// Remove um bloco específico da free list da ordem dada.
    /// Retorna false se o bloco não estiver na lista.
    fn unlink_block(&mut self, idx: usize, order: usize) -> bool {
        let target = idx as u32;
        let mut cur = self.free_lists[order];
        let mut prev = FRAME_NIL;
        while cur != FRAME_NIL {
            let next = self.table.meta(cur as usize).next_free;
            if cur == target {
                if prev == FRAME_NIL {
                    self.free_lists[order] = next;
                } else {
                    self.table.meta_mut(prev as usize).next_free = next;
                }
                let meta = self.table.meta_mut(idx);
                meta.next_free = FRAME_NIL;
                meta.order = ORDER_NONE;
                self.free_blocks[order] -= 1;
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    /// Frame `idx` é cabeça de bloco LIVRE de ordem `order`?
    fn is_free_head(&self, idx: usize, order: usize) -> bool {
        self.table.is_free(idx) && self.table.meta(idx).order == order as u8
    }

    // =========================================================================
    // ALOCAÇÃO / LIBERAÇÃO POR ORDEM
    // =========================================================================

    /// Aloca um bloco de 2^order páginas contíguas e alinhadas.
    pub fn alloc(&mut self, order: usize) -> MmResult<PhysAddr> {
        if order > BUDDY_MAX_ORDER {
            return Err(MmError::InvalidParameter);
        }

        // Sobe até a primeira free list populada
        let mut found = None;
        let mut k = order;
        while k <= BUDDY_MAX_ORDER {
            if let Some(idx) = self.pop_block(k) {
                found = Some((idx, k));
                break;
            }
            k += 1;
        }
        let (idx, from_order) = match found {
            Some(f) => f,
            None => {
                self.table.stats().inc_failed();
                crate::kwarn!("(Buddy) OOM ordem=", order);
                return Err(MmError::OutOfMemory);
            }
        };

        // Divide até a ordem pedida: a metade superior de cada split volta
        // para a free list da ordem menor
        let mut cur = from_order;
        while cur > order {
            cur -= 1;
            let half = 1usize << cur;
            self.push_block(idx + half, cur);
        }

        self.table.mark_range_used(idx, 1 << order);
        self.table.meta_mut(idx).order = order as u8; // ordem de alocação

        crate::ktrace!("(Buddy) alloc ordem=", order);
        Ok(self.table.addr_of(idx))
    }

    /// Libera um bloco de 2^order páginas alocado com `alloc`.
    pub fn free(&mut self, addr: PhysAddr, order: usize) -> MmResult<()> {
        if order > BUDDY_MAX_ORDER {
            return Err(MmError::InvalidParameter);
        }
        let idx = self.table.index_of(addr)?;
        let count = 1usize << order;
        if idx + count > self.table.total_frames() {
            return Err(MmError::OutOfBounds);
        }
        // O bloco deve estar alinhado à própria ordem (no pfn absoluto)
        if self.table.abs_pfn(idx) & (count as u64 - 1) != 0 {
            return Err(MmError::NotAligned);
        }
        if self.table.is_free(idx) {
            crate::kerror!("(Buddy) double free em=", addr.as_u64());
            return Err(MmError::DoubleFree);
        }
        // Valida a ordem de alocação quando o marcador existe
        let marked = self.table.meta(idx).order;
        if marked != ORDER_NONE && marked != order as u8 {
            crate::kerror!("(Buddy) free com ordem errada em=", addr.as_u64());
            return Err(MmError::InvalidParameter);
        }

        self.table.mark_range_free(idx, count);

        // Coalescência: funde com o buddy enquanto ele for um bloco livre
        // da mesma ordem
        let base_pfn = self.table.base().pfn();
        let mut cur = idx;
        let mut k = order;
        while k < BUDDY_MAX_ORDER {
            let abs = base_pfn + cur as u64;
            let buddy_abs = abs ^ (1u64 << k);
            if buddy_abs < base_pfn {
                break;
            }
            let b = (buddy_abs - base_pfn) as usize;
            if b + (1usize << k) > self.table.total_frames() {
                break;
            }
            if !self.is_free_head(b, k) {
                break;
            }
            if !self.unlink_block(b, k) {
                break;
            }
            cur = cur.min(b);
            k += 1;
        }

        self.push_block(cur, k);
        crate::ktrace!("(Buddy) free ordem=", order);
        Ok(())
    }

    // =========================================================================
    // RESERVA / LIBERAÇÃO DE FRAMES ESPECÍFICOS
    // =========================================================================

    /// Localiza o bloco livre que contém o frame `idx`.
    fn find_containing_block(&self, idx: usize) -> Option<(usize, usize)> {
        let base_pfn = self.table.base().pfn();
        let abs = base_pfn + idx as u64;
        let mut k = 0;
        while k <= BUDDY_MAX_ORDER {
            let head_abs = abs & !((1u64 << k) - 1);
            if head_abs >= base_pfn {
                let h = (head_abs - base_pfn) as usize;
                if h + (1usize << k) <= self.table.total_frames() && self.is_free_head(h, k) {
                    return Some((h, k));
                }
            }
            k += 1;
        }
        None
    }

    /// Retira um frame livre específico da free list que o contém,
    /// dividindo o bloco até isolar o frame.
    fn claim_specific(&mut self, idx: usize) -> MmResult<()> {
        debug_assert!(self.table.is_free(idx));
        let (head, order) = match self.find_containing_block(idx) {
            Some(b) => b,
            None => {
                // Frame livre fora de qualquer bloco: estado inconsistente
                crate::kerror!("(Buddy) frame livre órfão idx=", idx);
                return Err(MmError::InvalidAddress);
            }
        };
        if !self.unlink_block(head, order) {
            crate::kerror!("(Buddy) free list inconsistente ordem=", order);
            return Err(MmError::InvalidAddress);
        }

        // Desce dividindo; a metade que não contém o alvo volta para a lista
        let mut cur = head;
        let mut k = order;
        while k > 0 {
            k -= 1;
            let half = 1usize << k;
            if idx >= cur + half {
                self.push_block(cur, k);
                cur += half;
            } else {
                self.push_block(cur + half, k);
            }
        }
        debug_assert_eq!(cur, idx);

        self.table.mark_range_used(idx, 1);
        Ok(())
    }

    /// Reserva uma faixa de endereços. Frames já ocupados permanecem como
    /// estão; frames livres são retirados das free lists. Faixa fora da
    /// tabela é erro duro.
    pub fn reserve_region(&mut self, base: PhysAddr, size: u64) -> MmResult<()> {
        let (start, count) = self.region_to_frames(base, size)?;
        for idx in start..start + count {
            if self.table.is_free(idx) {
                self.claim_specific(idx)?;
            }
            self.table.meta_mut(idx).flags.insert(FrameFlags::RESERVED);
        }
        crate::kdebug!("(Buddy) região reservada frames=", count);
        Ok(())
    }

    /// Devolve uma faixa de endereços ao pool. Frames já livres são
    /// ignorados (as regiões usable do memory map podem se sobrepor).
    pub fn free_region(&mut self, base: PhysAddr, size: u64) -> MmResult<()> {
        let (start, count) = self.region_to_frames(base, size)?;
        for idx in start..start + count {
            if self.table.is_free(idx) {
                continue;
            }
            self.free(self.table.addr_of(idx), 0)?;
        }
        crate::kdebug!("(Buddy) região liberada frames=", count);
        Ok(())
    }

    fn region_to_frames(&self, base: PhysAddr, size: u64) -> MmResult<(usize, usize)> {
        if size == 0 {
            return Err(MmError::InvalidParameter);
        }
        let start = self.table.index_of(base.align_down(PAGE_SIZE as u64))?;
        let end_addr = base.add(size - 1).align_down(PAGE_SIZE as u64);
        let end = self.table.index_of(end_addr)?;
        Ok((start, end - start + 1))
    }

    // =========================================================================
    // API DE PÁGINAS (ordem 0 e contíguos exatos)
    // =========================================================================

    /// Aloca uma página física. Refcount inicia em 1 (caminho COW).
    pub fn alloc_page(&mut self) -> MmResult<PhysAddr> {
        let addr = self.alloc(0)?;
        let idx = self.table.index_of(addr)?;
        self.table.meta_mut(idx).ref_count = 1;
        Ok(addr)
    }

    /// Aloca exatamente `n` páginas contíguas.
    ///
    /// Caminho rápido: bloco buddy de ordem `ceil(log2(n))` com devolução
    /// da cauda não usada. Fallback: scan linear first-fit no bitmap quando
    /// não há bloco alinhado disponível.
    pub fn alloc_pages(&mut self, n: usize) -> MmResult<PhysAddr> {
        if n == 0 {
            return Err(MmError::InvalidParameter);
        }
        if n == 1 {
            return self.alloc_page();
        }

        let order = order_of(n * PAGE_SIZE);
        if order <= BUDDY_MAX_ORDER {
            match self.alloc(order) {
                Ok(addr) => {
                    let idx = self.table.index_of(addr)?;
                    // Devolve a cauda do bloco, página a página; a
                    // coalescência remonta os blocos maiores
                    let span = 1usize << order;
                    self.table.meta_mut(idx).order = ORDER_NONE;
                    let mut tail = n;
                    while tail < span {
                        self.free(self.table.addr_of(idx + tail), 0)?;
                        tail += 1;
                    }
                    self.finish_pages_alloc(idx, n);
                    return Ok(addr);
                }
                Err(MmError::OutOfMemory) => {} // tenta o fallback linear
                Err(e) => return Err(e),
            }
        }

        // Fallback: first-fit linear sobre o bitmap, O(total_frames)
        let start = match self.table.find_free_run(n) {
            Some(s) => s,
            None => {
                self.table.stats().inc_failed();
                crate::kwarn!("(Buddy) OOM contíguo n=", n);
                return Err(MmError::OutOfMemory);
            }
        };
        let mut idx = start;
        while idx < start + n {
            self.claim_specific(idx)?;
            idx += 1;
        }
        self.finish_pages_alloc(start, n);
        Ok(self.table.addr_of(start))
    }

    /// Marca as `n` páginas entregues como alocações de ordem 0 com
    /// refcount 1, para que cada uma possa ser liberada individualmente.
    fn finish_pages_alloc(&mut self, start: usize, n: usize) {
        for idx in start..start + n {
            let meta = self.table.meta_mut(idx);
            meta.order = 0;
            meta.ref_count = 1;
        }
        crate::ktrace!("(Buddy) alloc_pages n=", n);
    }

    /// Decrementa o refcount da página; só libera fisicamente quando a
    /// última referência cai (COW).
    pub fn free_page(&mut self, addr: PhysAddr) -> MmResult<()> {
        let idx = self.table.index_of(addr)?;
        if self.table.is_free(idx) {
            return Err(MmError::DoubleFree);
        }
        let meta = self.table.meta_mut(idx);
        if meta.ref_count == 0 {
            // Página ocupada sem refcount: não veio de alloc_page
            return Err(MmError::DoubleFree);
        }
        meta.ref_count -= 1;
        if meta.ref_count > 0 {
            crate::ktrace!("(PMM) free_page adiado refs=", meta.ref_count);
            return Ok(());
        }
        self.free(self.table.addr_of(idx), 0)
    }

    /// Libera `n` páginas contíguas (cada uma segue a regra de refcount).
    pub fn free_pages(&mut self, addr: PhysAddr, n: usize) -> MmResult<()> {
        if n == 0 {
            return Err(MmError::InvalidParameter);
        }
        let start = self.table.index_of(addr)?;
        if start + n > self.table.total_frames() {
            return Err(MmError::OutOfBounds);
        }
        let mut idx = start;
        while idx < start + n {
            self.free_page(self.table.addr_of(idx))?;
            idx += 1;
        }
        Ok(())
    }
}

// =============================================================================
// API GLOBAL POR ORDEM (contexto único de boot)
// =============================================================================

use crate::mm::with_allocator;

/// Aloca um bloco de 2^order páginas do contexto global.
pub fn alloc(order: usize) -> MmResult<PhysAddr> {
    with_allocator(|a| a.alloc(order))
}

/// Libera um bloco de 2^order páginas no contexto global.
pub fn free(addr: PhysAddr, order: usize) -> MmResult<()> {
    with_allocator(|a| a.free(addr, order))
}

/// Blocos livres na free list da ordem dada (diagnóstico/testes).
pub fn free_blocks_of(order: usize) -> MmResult<usize> {
    with_allocator(|a| Ok(a.free_blocks_of(order)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test::support;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn order_of_matches_ceil_log2() {
        assert_eq!(order_of(1), 0);
        assert_eq!(order_of(PAGE_SIZE), 0);
        assert_eq!(order_of(PAGE_SIZE + 1), 1);
        assert_eq!(order_of(2 * PAGE_SIZE), 1);
        assert_eq!(order_of(3 * PAGE_SIZE), 2);
        assert_eq!(order_of(8 * MIB), 11);
    }

    #[test]
    fn sixteen_mib_reserve_then_exhaust() {
        // 16 MiB => 4096 frames; reservando o primeiro 1 MiB sobram 3840
        // páginas, cada uma alocável individualmente, e nem uma a mais.
        let mut a = support::context(0, 16 * MIB);
        assert_eq!(a.table().total_frames(), 4096);

        a.reserve_region(PhysAddr::new(0), MIB as u64).unwrap();
        assert_eq!(a.table().free_frames(), 3840);

        let mut served = 0;
        loop {
            match a.alloc_page() {
                Ok(addr) => {
                    assert!(addr.as_u64() >= MIB as u64);
                    served += 1;
                    assert!(served <= 3840, "mais páginas do que o possível");
                }
                Err(MmError::OutOfMemory) => break,
                Err(e) => panic!("erro inesperado: {e:?}"),
            }
        }
        assert_eq!(served, 3840);
        assert_eq!(a.table().used_frames(), a.table().total_frames());
    }

    #[test]
    fn eight_mib_is_one_max_order_block() {
        // 8 MiB = 2048 páginas = exatamente um bloco de ordem 11
        let mut a = support::context(0, 8 * MIB);
        assert_eq!(a.free_blocks_of(BUDDY_MAX_ORDER), 1);

        let block = a.alloc(BUDDY_MAX_ORDER).unwrap();
        assert_eq!(block.as_u64(), 0);
        assert_eq!(a.alloc(BUDDY_MAX_ORDER), Err(MmError::OutOfMemory));

        a.free(block, BUDDY_MAX_ORDER).unwrap();
        assert!(a.alloc(BUDDY_MAX_ORDER).is_ok());
    }

    #[test]
    fn coalescing_deterministic_in_either_order() {
        // Liberar os dois irmãos de um split de ordem 4, em qualquer ordem,
        // produz exatamente um bloco de ordem 5 (que aqui coalesce até a
        // ordem máxima). Nunca dois blocos de ordem 4, nunca bloco sumido.
        for reverse in [false, true] {
            let mut a = support::context(0, 8 * MIB);
            let x = a.alloc(4).unwrap();
            let y = a.alloc(4).unwrap();
            // O segundo alloc serve o irmão criado pelo split do primeiro
            assert_eq!(x.pfn() ^ 16, y.pfn());

            if reverse {
                a.free(y, 4).unwrap();
                a.free(x, 4).unwrap();
            } else {
                a.free(x, 4).unwrap();
                a.free(y, 4).unwrap();
            }

            let mut k = 0;
            while k < BUDDY_MAX_ORDER {
                assert_eq!(a.free_blocks_of(k), 0, "resto na ordem {k}");
                k += 1;
            }
            assert_eq!(a.free_blocks_of(BUDDY_MAX_ORDER), 1);
        }
    }

    #[test]
    fn roundtrip_restores_per_order_counts() {
        let mut a = support::context(0, 16 * MIB);
        let mut before = [0usize; BUDDY_MAX_ORDER + 1];
        for (k, slot) in before.iter_mut().enumerate() {
            *slot = a.free_blocks_of(k);
        }

        let addr = a.alloc(6).unwrap();
        a.free(addr, 6).unwrap();

        for (k, expected) in before.iter().enumerate() {
            assert_eq!(a.free_blocks_of(k), *expected, "ordem {k}");
        }
    }

    #[test]
    fn alloc_pages_trims_to_exact_count() {
        let mut a = support::context(0, 16 * MIB);
        assert_eq!(a.table().used_frames(), 0);

        let addr = a.alloc_pages(3).unwrap();
        // Ordem 2 (4 páginas) com a cauda devolvida: só 3 frames ocupados
        assert_eq!(a.table().used_frames(), 3);

        a.free_pages(addr, 3).unwrap();
        assert_eq!(a.table().used_frames(), 0);
        // Tudo coalesceu de volta: 16 MiB = 2 blocos de ordem máxima
        assert_eq!(a.free_blocks_of(BUDDY_MAX_ORDER), 2);
    }

    #[test]
    fn alloc_pages_falls_back_to_linear_scan() {
        // 16 páginas totalmente alocadas; libera os frames 5..8. Não existe
        // bloco de ordem 2 alinhado livre, mas o scan linear acha a run.
        let mut a = support::context(0, 16 * PAGE_SIZE);
        let mut i = 0;
        while i < 16 {
            a.alloc_page().unwrap();
            i += 1;
        }
        for pfn in [5u64, 6, 7] {
            a.free_page(PhysAddr::new(pfn * PAGE_SIZE as u64)).unwrap();
        }

        let addr = a.alloc_pages(3).unwrap();
        assert_eq!(addr.as_u64(), 5 * PAGE_SIZE as u64);
        assert_eq!(a.table().used_frames(), 16);
    }

    #[test]
    fn region_out_of_range_is_hard_error() {
        let mut a = support::context(0, MIB);
        let beyond = PhysAddr::new(2 * MIB as u64);
        assert_eq!(
            a.reserve_region(beyond, PAGE_SIZE as u64),
            Err(MmError::OutOfBounds)
        );
        assert_eq!(
            a.free_region(beyond, PAGE_SIZE as u64),
            Err(MmError::OutOfBounds)
        );
        // Começa dentro e termina fora: também é erro, sem efeito parcial
        let tail = PhysAddr::new((MIB - PAGE_SIZE) as u64);
        assert_eq!(
            a.reserve_region(tail, 2 * PAGE_SIZE as u64),
            Err(MmError::OutOfBounds)
        );
        assert_eq!(a.table().free_frames(), MIB / PAGE_SIZE);
    }

    #[test]
    fn double_free_and_wrong_order_rejected() {
        let mut a = support::context(0, MIB);
        let x = a.alloc(1).unwrap();
        assert_eq!(a.free(x, 0), Err(MmError::InvalidParameter));
        a.free(x, 1).unwrap();
        assert_eq!(a.free(x, 1), Err(MmError::DoubleFree));
    }

    #[test]
    fn unaligned_block_free_rejected() {
        let mut a = support::context(0, MIB);
        let x = a.alloc(2).unwrap();
        assert_eq!(
            a.free(x.add(PAGE_SIZE as u64), 2),
            Err(MmError::NotAligned)
        );
        a.free(x, 2).unwrap();
    }

    #[test]
    fn buddy_math_uses_absolute_pfn() {
        // Base física não-nula alinhada: o XOR do buddy opera no pfn
        // absoluto e a região ainda coalesce num único bloco máximo
        let base = 16 * MIB as u64;
        let mut a = support::context(base, 8 * MIB);
        assert_eq!(a.free_blocks_of(BUDDY_MAX_ORDER), 1);

        let block = a.alloc(BUDDY_MAX_ORDER).unwrap();
        assert_eq!(block.as_u64(), base);
        a.free(block, BUDDY_MAX_ORDER).unwrap();
        assert_eq!(a.free_blocks_of(BUDDY_MAX_ORDER), 1);
    }

    #[test]
    fn zero_pages_request_rejected() {
        let mut a = support::context(0, MIB);
        assert_eq!(a.alloc_pages(0), Err(MmError::InvalidParameter));
        assert_eq!(a.free_pages(PhysAddr::zero(), 0), Err(MmError::InvalidParameter));
    }
}
