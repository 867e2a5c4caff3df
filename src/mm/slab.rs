//! # Slab Cache
//!
//! Caches de objetos de tamanho fixo para as estruturas internas do kernel
//! (processos, inodes, buffers de rede). O backing de cada slab vem SEMPRE
//! do Buddy; o Slab nunca toca o bitmap de frames diretamente.
//!
//! ## 🏗️ Organização
//!
//! - Cada cache mantém três listas de slabs: `empty`, `partial` e `full`.
//!   A lista de um slab é função pura do número de objetos livres
//!   (todos / alguns / nenhum).
//! - A free list de objetos é encadeada por ÍNDICE dentro da própria
//!   memória do slab: os primeiros 4 bytes de cada objeto livre guardam o
//!   índice do próximo livre. Índices são validados contra
//!   `objects_per_slab` antes de qualquer uso.
//! - Os descritores de slab vivem num array fixo por cache
//!   (`MAX_SLABS_PER_CACHE` slots), encadeados por índice u16. Nada de
//!   ponteiros soltos em memória livre.
//!
//! ## Política de retenção
//!
//! Slabs que esvaziam vão para a lista `empty` e ficam retidos para reuso.
//! Não há devolução de backing ao Buddy: cargas cíclicas de alloc/free não
//! pagam o custo de reconstruir slabs (anti-thrash).
//!
//! ## Concorrência
//!
//! Um lock por cache cobre alloc/free inteiros. O registro de caches tem
//! lock próprio, usado apenas em `create`. Ordem global de aquisição:
//! alocador físico → cache (ver `mm`).

use crate::klib::align_up;
use crate::mm::addr::{phys_to_virt, virt_to_phys, PhysAddr};
use crate::mm::buddy::{order_of, BuddyAllocator};
use crate::mm::config::{MAX_SLABS_PER_CACHE, MAX_SLAB_CACHES, PAGE_SIZE, SLAB_MIN_OBJECT_SIZE};
use crate::mm::error::{MmError, MmResult};
use core::ptr::NonNull;
use spin::Mutex;

/// Índice nulo na free list de objetos
const OBJ_NIL: u32 = u32::MAX;

/// Índice nulo nas listas de slabs
const SLOT_NIL: u16 = u16::MAX;

/// Em qual das três listas um slab está
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabList {
    Empty,
    Partial,
    Full,
}

/// Descritor de um slab (um bloco de backing do Buddy)
#[derive(Debug, Clone, Copy)]
struct SlabSlot {
    used: bool,
    /// Endereço físico do backing (identity map)
    base: u64,
    /// Índice do primeiro objeto livre (OBJ_NIL = slab cheio)
    free_head: u32,
    /// Objetos livres neste slab
    free_count: u32,
    /// Próximo slab na mesma lista (SLOT_NIL = fim)
    next: u16,
}

impl SlabSlot {
    const VACANT: SlabSlot = SlabSlot {
        used: false,
        base: 0,
        free_head: OBJ_NIL,
        free_count: 0,
        next: SLOT_NIL,
    };
}

/// Estado interno de um cache (protegido pelo lock do cache)
struct CacheInner {
    name: &'static str,
    object_size: usize,
    objects_per_slab: usize,
    /// Ordem do bloco de backing pedido ao Buddy
    slab_order: usize,
    slots: [SlabSlot; MAX_SLABS_PER_CACHE],
    empty: u16,
    partial: u16,
    full: u16,
    free_objects: usize,
    total_objects: usize,
}

impl CacheInner {
    fn head(&self, list: SlabList) -> u16 {
        match list {
            SlabList::Empty => self.empty,
            SlabList::Partial => self.partial,
            SlabList::Full => self.full,
        }
    }

    fn set_head(&mut self, list: SlabList, si: u16) {
        match list {
            SlabList::Empty => self.empty = si,
            SlabList::Partial => self.partial = si,
            SlabList::Full => self.full = si,
        }
    }

    fn push_slab(&mut self, list: SlabList, si: u16) {
        self.slots[si as usize].next = self.head(list);
        self.set_head(list, si);
    }

    fn pop_slab(&mut self, list: SlabList) -> Option<u16> {
        let head = self.head(list);
        if head == SLOT_NIL {
            return None;
        }
        let next = self.slots[head as usize].next;
        self.set_head(list, next);
        self.slots[head as usize].next = SLOT_NIL;
        Some(head)
    }

    /// Remove um slab específico da lista (scan na lista encadeada).
    fn remove_slab(&mut self, list: SlabList, si: u16) {
        let mut cur = self.head(list);
        let mut prev = SLOT_NIL;
        while cur != SLOT_NIL {
            let next = self.slots[cur as usize].next;
            if cur == si {
                if prev == SLOT_NIL {
                    self.set_head(list, next);
                } else {
                    self.slots[prev as usize].next = next;
                }
                self.slots[si as usize].next = SLOT_NIL;
                return;
            }
            prev = cur;
            cur = next;
        }
        debug_assert!(false, "slab fora da lista esperada");
    }

    fn find_vacant(&self) -> Option<u16> {
        let mut si = 0;
        while si < MAX_SLABS_PER_CACHE {
            if !self.slots[si].used {
                return Some(si as u16);
            }
            si += 1;
        }
        None
    }

    /// Bytes ocupados pelos objetos de um slab (o backing pode ser maior).
    #[inline]
    fn object_span(&self) -> u64 {
        (self.objects_per_slab * self.object_size) as u64
    }

    /// Procura o slab cujo range de objetos contém `addr`.
    /// A lista `full` é percorrida antes da `partial`.
    fn find_slab_containing(&self, addr: u64) -> Option<(SlabList, u16)> {
        for list in [SlabList::Full, SlabList::Partial] {
            let mut cur = self.head(list);
            while cur != SLOT_NIL {
                let slot = &self.slots[cur as usize];
                if addr >= slot.base && addr < slot.base + self.object_span() {
                    return Some((list, cur));
                }
                cur = slot.next;
            }
        }
        None
    }

    /// Grava o índice do próximo objeto livre nos 4 primeiros bytes do
    /// objeto `idx`.
    ///
    /// # Safety
    /// O backing do slab deve estar mapeado (identity map) e o objeto deve
    /// estar livre; `idx < objects_per_slab`.
    unsafe fn write_link(&self, base: u64, idx: u32, next: u32) {
        let addr = PhysAddr::new(base + idx as u64 * self.object_size as u64);
        let ptr: *mut u32 = phys_to_virt(addr);
        ptr.write(next);
    }

    /// Lê o índice do próximo objeto livre do objeto `idx`.
    ///
    /// # Safety
    /// Mesmas condições de `write_link`.
    unsafe fn read_link(&self, base: u64, idx: u32) -> u32 {
        let addr = PhysAddr::new(base + idx as u64 * self.object_size as u64);
        let ptr: *const u32 = phys_to_virt(addr);
        ptr.read()
    }

    /// Constrói um slab novo com backing do Buddy e devolve o slot.
    /// O caller decide em qual lista inserir.
    fn grow(&mut self, phys: &mut BuddyAllocator, owner_tag: u64) -> MmResult<u16> {
        let si = match self.find_vacant() {
            Some(si) => si,
            None => {
                crate::kwarn!("(Slab) cache sem slots livres obj_size=", self.object_size);
                return Err(MmError::OutOfMemory);
            }
        };

        let base = phys.alloc(self.slab_order)?;

        // Anota o dono nos frames de backing (diagnóstico de pertencimento)
        let pages = 1usize << self.slab_order;
        let mut p = 0;
        while p < pages {
            phys.table_mut()
                .set_owner(base.add((p * PAGE_SIZE) as u64), owner_tag)?;
            p += 1;
        }

        // Enfileira todos os objetos na free list por índice
        let n = self.objects_per_slab as u32;
        let mut i = 0u32;
        while i < n {
            let next = if i + 1 == n { OBJ_NIL } else { i + 1 };
            // SAFETY: bloco recém-alocado do Buddy, mapeado e exclusivo
            unsafe { self.write_link(base.as_u64(), i, next) };
            i += 1;
        }

        let slot = &mut self.slots[si as usize];
        slot.used = true;
        slot.base = base.as_u64();
        slot.free_head = 0;
        slot.free_count = n;
        slot.next = SLOT_NIL;

        self.total_objects += n as usize;
        self.free_objects += n as usize;

        crate::kdebug!("(Slab) slab novo base=", base.as_u64());
        Ok(si)
    }
}

/// Snapshot de contadores de um cache
#[derive(Debug, Clone, Copy)]
pub struct SlabStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub free_objects: usize,
    pub total_objects: usize,
    pub slabs: usize,
}

/// Cache de objetos de tamanho fixo.
///
/// Criado uma vez por tipo de objeto do kernel via `create`/`slab_create`.
/// As operações travam o lock do próprio cache; criação usa o lock do
/// registro global.
pub struct SlabCache {
    inner: Mutex<Option<CacheInner>>,
}

impl SlabCache {
    const fn unregistered() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Aloca um objeto. Ordem de busca: slab partial, senão um empty é
    /// promovido, senão um slab novo é construído com backing do Buddy.
    pub fn alloc(&self, phys: &mut BuddyAllocator) -> MmResult<NonNull<u8>> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(MmError::NotInitialized)?;

        if inner.partial == SLOT_NIL {
            if let Some(si) = inner.pop_slab(SlabList::Empty) {
                crate::ktrace!("(Slab) empty->partial slot=", si);
                inner.push_slab(SlabList::Partial, si);
            } else {
                let tag = self as *const SlabCache as u64;
                let si = inner.grow(phys, tag)?;
                inner.push_slab(SlabList::Partial, si);
            }
        }

        let si = inner.partial;
        let slot = inner.slots[si as usize];
        let obj = slot.free_head;
        if obj == OBJ_NIL || obj as usize >= inner.objects_per_slab {
            crate::kerror!("(Slab) free list corrompida head=", obj);
            return Err(MmError::InvalidAddress);
        }
        // SAFETY: objeto livre dentro do slab, backing mapeado
        let next = unsafe { inner.read_link(slot.base, obj) };
        if next != OBJ_NIL && next as usize >= inner.objects_per_slab {
            crate::kerror!("(Slab) free list corrompida next=", next);
            return Err(MmError::InvalidAddress);
        }

        inner.slots[si as usize].free_head = next;
        inner.slots[si as usize].free_count -= 1;
        inner.free_objects -= 1;

        // Último objeto livre consumido: partial -> full
        if inner.slots[si as usize].free_count == 0 {
            inner.remove_slab(SlabList::Partial, si);
            inner.push_slab(SlabList::Full, si);
        }

        let addr = PhysAddr::new(slot.base + obj as u64 * inner.object_size as u64);
        crate::ktrace!("(Slab) alloc obj=", addr.as_u64());
        // SAFETY: endereço dentro do backing do slab, nunca nulo
        let ptr: *mut u8 = unsafe { phys_to_virt(addr) };
        NonNull::new(ptr).ok_or(MmError::InvalidAddress)
    }

    /// Devolve um objeto ao slab dono. O slab é localizado por scan na
    /// lista full e depois na partial, O(slabs do cache).
    pub fn free(&self, obj: NonNull<u8>) -> MmResult<()> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(MmError::NotInitialized)?;

        let addr = virt_to_phys(obj.as_ptr() as *const u8).as_u64();
        let (list, si) = match inner.find_slab_containing(addr) {
            Some(hit) => hit,
            None => {
                crate::kerror!("(Slab) free de endereço desconhecido=", addr);
                return Err(MmError::InvalidAddress);
            }
        };

        let base = inner.slots[si as usize].base;
        let offset = addr - base;
        if offset % inner.object_size as u64 != 0 {
            crate::kerror!("(Slab) free desalinhado ao objeto=", addr);
            return Err(MmError::InvalidAddress);
        }
        let idx = (offset / inner.object_size as u64) as u32;

        // SAFETY: objeto pertence ao slab e volta a ser considerado livre
        unsafe { inner.write_link(base, idx, inner.slots[si as usize].free_head) };
        inner.slots[si as usize].free_head = idx;
        inner.slots[si as usize].free_count += 1;
        inner.free_objects += 1;

        // Reclassificação pelo novo número de objetos livres
        let fc = inner.slots[si as usize].free_count as usize;
        if fc == inner.objects_per_slab {
            inner.remove_slab(list, si);
            inner.push_slab(SlabList::Empty, si);
        } else if list == SlabList::Full {
            inner.remove_slab(SlabList::Full, si);
            inner.push_slab(SlabList::Partial, si);
        }

        crate::ktrace!("(Slab) free obj=", addr);
        Ok(())
    }

    pub fn name(&self) -> MmResult<&'static str> {
        let guard = self.inner.lock();
        guard.as_ref().map(|i| i.name).ok_or(MmError::NotInitialized)
    }

    pub fn stats(&self) -> MmResult<SlabStats> {
        let guard = self.inner.lock();
        let inner = guard.as_ref().ok_or(MmError::NotInitialized)?;
        let mut slabs = 0;
        let mut si = 0;
        while si < MAX_SLABS_PER_CACHE {
            if inner.slots[si].used {
                slabs += 1;
            }
            si += 1;
        }
        Ok(SlabStats {
            object_size: inner.object_size,
            objects_per_slab: inner.objects_per_slab,
            free_objects: inner.free_objects,
            total_objects: inner.total_objects,
            slabs,
        })
    }
}

// =============================================================================
// REGISTRO GLOBAL DE CACHES
// =============================================================================

/// Número de caches já registrados (protege a criação, não o uso)
static REGISTRY: Mutex<usize> = Mutex::new(0);

const UNREGISTERED: SlabCache = SlabCache::unregistered();
static CACHES: [SlabCache; MAX_SLAB_CACHES] = [UNREGISTERED; MAX_SLAB_CACHES];

/// Cria e registra um cache de objetos.
///
/// O tamanho é arredondado para cima ao alinhamento (mínimo de 4 bytes,
/// exigência da free list por índice). `objects_per_slab` é
/// `max(1, PAGE_SIZE / object_size)`; objetos maiores que uma página usam
/// um bloco de backing de ordem maior com um objeto por slab.
pub fn create(
    name: &'static str,
    object_size: usize,
    align: usize,
) -> MmResult<&'static SlabCache> {
    if object_size == 0 || align == 0 || !align.is_power_of_two() {
        return Err(MmError::InvalidParameter);
    }
    let align = align.max(SLAB_MIN_OBJECT_SIZE);
    let object_size = align_up(object_size.max(SLAB_MIN_OBJECT_SIZE), align);
    let objects_per_slab = core::cmp::max(1, PAGE_SIZE / object_size);
    let slab_order = if object_size > PAGE_SIZE {
        order_of(object_size)
    } else {
        0
    };

    let mut registered = REGISTRY.lock();
    if *registered >= MAX_SLAB_CACHES {
        crate::kerror!("(Slab) registro cheio, caches=", *registered);
        return Err(MmError::OutOfMemory);
    }
    let cache = &CACHES[*registered];
    *cache.inner.lock() = Some(CacheInner {
        name,
        object_size,
        objects_per_slab,
        slab_order,
        slots: [SlabSlot::VACANT; MAX_SLABS_PER_CACHE],
        empty: SLOT_NIL,
        partial: SLOT_NIL,
        full: SLOT_NIL,
        free_objects: 0,
        total_objects: 0,
    });
    *registered += 1;

    crate::kinfo!("(Slab) cache criado obj_size=", object_size);
    Ok(cache)
}

/// Número de caches registrados.
pub fn registered_caches() -> usize {
    *REGISTRY.lock()
}

// =============================================================================
// API GLOBAL (contexto único de boot)
// =============================================================================

use crate::mm::with_allocator;

/// Cria um cache de objetos (atalho com a assinatura clássica).
pub fn slab_create(
    name: &'static str,
    object_size: usize,
    align: usize,
) -> MmResult<&'static SlabCache> {
    create(name, object_size, align)
}

/// Aloca um objeto do cache usando o alocador físico global como backing.
pub fn slab_alloc(cache: &SlabCache) -> MmResult<NonNull<u8>> {
    with_allocator(|a| cache.alloc(a))
}

/// Devolve um objeto ao cache.
pub fn slab_free(cache: &SlabCache, obj: NonNull<u8>) -> MmResult<()> {
    cache.free(obj)
}
