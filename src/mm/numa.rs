//! # NUMA - Topologia e Alocação por Nó
//!
//! Deriva uma topologia sintética de nós a partir da contagem de CPUs (sem
//! parse de tabelas ACPI/SRAT) e expõe alocação com dica de nó.
//!
//! ## ⚠️ Semântica advisory
//!
//! `alloc(node, size)` é DICA, não garantia: a alocação sempre desce pelo
//! caminho genérico do Buddy, e o contador de memória livre do nó é
//! atualizado apenas como bookkeeping. Nó inválido ou topologia não
//! inicializada caem no caminho genérico sem bookkeeping nenhum. Nada aqui
//! restringe o posicionamento físico real.
//!
//! ## Heurística de detecção
//!
//! Mais de 8 CPUs: 2 nós, memória e CPUs divididas ao meio. Caso contrário
//! nó único. Distâncias sintéticas: 10 local, 20 remoto. A topologia é
//! computada uma vez no boot e nunca recalculada (sem hot-plug).

use crate::mm::addr::PhysAddr;
use crate::mm::buddy::order_of;
use crate::mm::config::{
    MAX_CPUS, MAX_NUMA_NODES, NUMA_LOCAL_DISTANCE, NUMA_REMOTE_DISTANCE,
    NUMA_SPLIT_CPU_THRESHOLD, PAGE_SIZE,
};
use crate::mm::error::{MmError, MmResult};
use crate::mm::with_allocator;
use spin::{Mutex, Once};

/// Identificador de nó NUMA
pub type NodeId = usize;

/// Um nó NUMA: CPUs + memória com latência interna uniforme
#[derive(Debug, Clone, Copy)]
pub struct NumaNode {
    pub id: NodeId,
    pub total_memory: u64,
    pub free_memory: u64,
    /// Bit i ligado = CPU i pertence a este nó
    pub cpu_mask: u64,
    /// Distância deste nó para cada outro nó
    pub distance: [u8; MAX_NUMA_NODES],
}

impl NumaNode {
    const fn empty(id: NodeId) -> Self {
        Self {
            id,
            total_memory: 0,
            free_memory: 0,
            cpu_mask: 0,
            distance: [NUMA_LOCAL_DISTANCE; MAX_NUMA_NODES],
        }
    }
}

/// Topologia NUMA do sistema
pub struct NumaTopology {
    nodes: [NumaNode; MAX_NUMA_NODES],
    node_count: usize,
}

impl NumaTopology {
    /// Deriva a topologia pela heurística de contagem de CPUs.
    pub fn detect(cpu_count: usize, mem_size: u64) -> MmResult<Self> {
        if cpu_count == 0 || mem_size == 0 {
            return Err(MmError::InvalidParameter);
        }
        let cpu_count = if cpu_count > MAX_CPUS {
            crate::kwarn!("(NUMA) cpu_count acima do suportado=", cpu_count);
            MAX_CPUS
        } else {
            cpu_count
        };

        let node_count = if cpu_count > NUMA_SPLIT_CPU_THRESHOLD { 2 } else { 1 };

        let mut nodes = [NumaNode::empty(0); MAX_NUMA_NODES];

        let mem_per_node = mem_size / node_count as u64;
        let cpus_per_node = cpu_count / node_count;

        let mut n = 0;
        while n < node_count {
            let node = &mut nodes[n];
            node.id = n;

            // Último nó absorve os restos da divisão
            let last = n == node_count - 1;
            node.total_memory = if last {
                mem_size - mem_per_node * (node_count as u64 - 1)
            } else {
                mem_per_node
            };
            node.free_memory = node.total_memory;

            let cpu_start = n * cpus_per_node;
            let cpu_end = if last { cpu_count } else { cpu_start + cpus_per_node };
            let mut cpu = cpu_start;
            while cpu < cpu_end {
                node.cpu_mask |= 1u64 << cpu;
                cpu += 1;
            }

            let mut other = 0;
            while other < MAX_NUMA_NODES {
                node.distance[other] = if other == n {
                    NUMA_LOCAL_DISTANCE
                } else {
                    NUMA_REMOTE_DISTANCE
                };
                other += 1;
            }
            n += 1;
        }

        Ok(Self { nodes, node_count })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn node(&self, id: NodeId) -> Option<&NumaNode> {
        if id < self.node_count {
            Some(&self.nodes[id])
        } else {
            None
        }
    }

    /// Nó da CPU dada, por pertencimento na máscara. CPU desconhecida
    /// responde nó 0.
    pub fn node_of_cpu(&self, cpu: usize) -> NodeId {
        if cpu >= MAX_CPUS {
            return 0;
        }
        let mut n = 0;
        while n < self.node_count {
            if self.nodes[n].cpu_mask & (1u64 << cpu) != 0 {
                return n;
            }
            n += 1;
        }
        0
    }

    /// Soma da memória livre contabilizada em todos os nós.
    pub fn total_free(&self) -> u64 {
        let mut sum = 0;
        let mut n = 0;
        while n < self.node_count {
            sum += self.nodes[n].free_memory;
            n += 1;
        }
        sum
    }

    /// Baixa `bytes` do contador do nó. Nunca fica negativo.
    fn charge(&mut self, node: NodeId, bytes: u64) {
        if node < self.node_count {
            let n = &mut self.nodes[node];
            n.free_memory = n.free_memory.saturating_sub(bytes);
        }
    }
}

// =============================================================================
// TOPOLOGIA GLOBAL (computada uma vez no boot)
// =============================================================================

static TOPOLOGY: Mutex<Option<NumaTopology>> = Mutex::new(None);

/// Fonte do id da CPU corrente, registrada pelo kernel hospedeiro
/// (tipicamente lê o APIC id). Sem registro, assume CPU 0.
static CPU_ID_SOURCE: Once<fn() -> usize> = Once::new();

/// Registra a fonte de id de CPU. Só o primeiro registro tem efeito.
pub fn set_cpu_id_source(source: fn() -> usize) {
    CPU_ID_SOURCE.call_once(|| source);
}

fn current_cpu() -> usize {
    match CPU_ID_SOURCE.get() {
        Some(source) => source(),
        None => 0,
    }
}

/// Computa a topologia global. Re-inicialização é rejeitada.
pub fn init(cpu_count: usize, mem_size: u64) -> MmResult<()> {
    let mut guard = TOPOLOGY.lock();
    if guard.is_some() {
        crate::kerror!("(NUMA) init duplicado rejeitado");
        return Err(MmError::InitFailed);
    }
    let topo = NumaTopology::detect(cpu_count, mem_size)?;
    crate::kinfo!("(NUMA) nós detectados=", topo.node_count());
    *guard = Some(topo);
    Ok(())
}

/// Nó da CPU que está executando. Topologia ausente responde nó 0.
pub fn current_node() -> NodeId {
    let guard = TOPOLOGY.lock();
    match guard.as_ref() {
        Some(topo) => topo.node_of_cpu(current_cpu()),
        None => 0,
    }
}

/// Número de nós da topologia global (0 antes do init).
pub fn node_count() -> usize {
    TOPOLOGY.lock().as_ref().map(|t| t.node_count()).unwrap_or(0)
}

/// Snapshot de um nó da topologia global.
pub fn node_info(id: NodeId) -> Option<NumaNode> {
    TOPOLOGY.lock().as_ref().and_then(|t| t.node(id).copied())
}

/// Soma da memória livre contabilizada (diagnóstico/testes).
pub fn total_free() -> u64 {
    TOPOLOGY.lock().as_ref().map(|t| t.total_free()).unwrap_or(0)
}

/// Aloca `size` bytes com DICA de nó.
///
/// Sempre serve pelo caminho genérico do Buddy. Com nó válido, o contador
/// de memória livre do nó é baixado pelo tamanho do bloco entregue; nó
/// inválido ou topologia não inicializada pulam o bookkeeping.
pub fn alloc(node: NodeId, size: usize) -> MmResult<PhysAddr> {
    if size == 0 {
        return Err(MmError::InvalidParameter);
    }
    let order = order_of(size);
    let addr = with_allocator(|a| a.alloc(order))?;

    let mut guard = TOPOLOGY.lock();
    if let Some(topo) = guard.as_mut() {
        if node < topo.node_count() {
            topo.charge(node, (PAGE_SIZE << order) as u64);
        } else {
            crate::ktrace!("(NUMA) dica de nó inválida=", node);
        }
    }

    crate::ktrace!("(NUMA) alloc nó=", node);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn few_cpus_make_a_single_node() {
        let topo = NumaTopology::detect(4, 64 * MIB).unwrap();
        assert_eq!(topo.node_count(), 1);

        let node = topo.node(0).unwrap();
        assert_eq!(node.total_memory, 64 * MIB);
        assert_eq!(node.free_memory, 64 * MIB);
        assert_eq!(node.cpu_mask, 0b1111);
        assert_eq!(node.distance[0], NUMA_LOCAL_DISTANCE);
        assert!(topo.node(1).is_none());
    }

    #[test]
    fn many_cpus_split_into_two_nodes() {
        let topo = NumaTopology::detect(16, 64 * MIB).unwrap();
        assert_eq!(topo.node_count(), 2);

        let n0 = topo.node(0).unwrap();
        let n1 = topo.node(1).unwrap();
        assert_eq!(n0.total_memory, 32 * MIB);
        assert_eq!(n1.total_memory, 32 * MIB);
        assert_eq!(n0.cpu_mask, 0x00FF);
        assert_eq!(n1.cpu_mask, 0xFF00);
        assert_eq!(n0.distance[1], NUMA_REMOTE_DISTANCE);
        assert_eq!(n1.distance[0], NUMA_REMOTE_DISTANCE);
        assert_eq!(n1.distance[1], NUMA_LOCAL_DISTANCE);
    }

    #[test]
    fn odd_counts_leave_remainder_on_last_node() {
        let topo = NumaTopology::detect(9, 65 * MIB).unwrap();
        assert_eq!(topo.node_count(), 2);

        let n0 = topo.node(0).unwrap();
        let n1 = topo.node(1).unwrap();
        // 9 CPUs: 4 no nó 0, 5 no nó 1
        assert_eq!(n0.cpu_mask.count_ones(), 4);
        assert_eq!(n1.cpu_mask.count_ones(), 5);
        // Nenhuma CPU em dois nós
        assert_eq!(n0.cpu_mask & n1.cpu_mask, 0);
        // Memória: o resto da divisão fica no último nó
        assert_eq!(n0.total_memory + n1.total_memory, 65 * MIB);
    }

    #[test]
    fn node_of_cpu_follows_masks() {
        let topo = NumaTopology::detect(16, 64 * MIB).unwrap();
        assert_eq!(topo.node_of_cpu(0), 0);
        assert_eq!(topo.node_of_cpu(7), 0);
        assert_eq!(topo.node_of_cpu(8), 1);
        assert_eq!(topo.node_of_cpu(15), 1);
        // CPU fora das máscaras cai no nó 0
        assert_eq!(topo.node_of_cpu(40), 0);
        assert_eq!(topo.node_of_cpu(usize::MAX), 0);
    }

    #[test]
    fn charge_saturates_at_zero() {
        let mut topo = NumaTopology::detect(4, 8 * MIB).unwrap();
        topo.charge(0, 5 * MIB);
        assert_eq!(topo.node(0).unwrap().free_memory, 3 * MIB);
        topo.charge(0, u64::MAX);
        assert_eq!(topo.node(0).unwrap().free_memory, 0);
        assert_eq!(topo.total_free(), 0);
        // Nó inexistente é ignorado
        topo.charge(7, MIB);
    }

    #[test]
    fn detect_rejects_degenerate_input() {
        assert!(NumaTopology::detect(0, MIB).is_err());
        assert!(NumaTopology::detect(4, 0).is_err());
        // Acima do suportado: clamp, não erro
        let topo = NumaTopology::detect(1000, 64 * MIB).unwrap();
        assert_eq!(topo.node_count(), 2);
    }
}
