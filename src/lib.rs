//! Magma MM.
//!
//! Subsistema de gerenciamento de memória física do Magma Kernel.
//! Contém a hierarquia completa de alocadores do kernel:
//!
//! - `mm::pmm`   - FrameTable: bitmap + metadados (refcount, flags) por frame
//! - `mm::buddy` - Alocador Buddy: blocos contíguos de potência de 2
//! - `mm::slab`  - Caches Slab: objetos de tamanho fixo sobre o Buddy
//! - `mm::numa`  - Topologia NUMA: alocação advisory por nó
//!
//! O crate é `no_std` e não depende de heap. Toda a memória de bookkeeping
//! é fornecida pelo kernel hospedeiro na inicialização.

#![cfg_attr(not(test), no_std)]

// --- Infraestrutura (Logs, Console) ---
pub mod logging; // Macros de log zero-overhead (kinfo!, ktrace!, ...)
pub mod console; // Sink de saída plugável (serial no kernel real)

// --- Utilitários Internos ---
pub mod klib; // Bitmap genérico, alinhamento, framework de testes

// --- Subsistema Principal ---
pub mod mm; // PMM, Buddy, Slab, NUMA

// Re-exportar os tipos mais usados pelos outros subsistemas do kernel
pub use mm::addr::PhysAddr;
pub use mm::error::{MmError, MmResult};
