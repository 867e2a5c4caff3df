//! # Configuração do Módulo de Memória
//!
//! Define constantes e limites globais do subsistema MM.

use static_assertions::const_assert;

// =============================================================================
// CONSTANTES DE TAMANHO
// =============================================================================

/// Tamanho de uma página (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Máscara para alinhar endereços a página
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Bits de offset dentro de uma página
pub const PAGE_OFFSET_BITS: usize = 12;

// =============================================================================
// CONFIGURAÇÃO DO BUDDY
// =============================================================================

/// Ordem máxima do Buddy allocator (2^11 = 2048 páginas = 8 MiB)
pub const BUDDY_MAX_ORDER: usize = 11;

// =============================================================================
// CONFIGURAÇÃO DO SLAB
// =============================================================================

/// Número máximo de caches Slab registráveis
pub const MAX_SLAB_CACHES: usize = 16;

/// Número máximo de slabs por cache
pub const MAX_SLABS_PER_CACHE: usize = 64;

/// Tamanho mínimo de objeto Slab (a free list usa índices u32 no slot)
pub const SLAB_MIN_OBJECT_SIZE: usize = 4;

// =============================================================================
// CONFIGURAÇÃO SMP / NUMA
// =============================================================================

/// Número máximo de CPUs suportadas
pub const MAX_CPUS: usize = 64;

/// Número máximo de nós NUMA
pub const MAX_NUMA_NODES: usize = 4;

/// Acima desta contagem de CPUs a heurística divide em 2 nós
pub const NUMA_SPLIT_CPU_THRESHOLD: usize = 8;

/// Distância NUMA para acesso local
pub const NUMA_LOCAL_DISTANCE: u8 = 10;

/// Distância NUMA para acesso remoto
pub const NUMA_REMOTE_DISTANCE: u8 = 20;

// =============================================================================
// SANIDADE (compile-time)
// =============================================================================

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(BUDDY_MAX_ORDER < 32);
const_assert!(MAX_NUMA_NODES >= 2);
const_assert!(MAX_CPUS <= 64); // cpu_mask é u64
const_assert!(SLAB_MIN_OBJECT_SIZE >= core::mem::size_of::<u32>());
