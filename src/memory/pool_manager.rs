// Fan-out of slab pools across size classes and NUMA nodes.

use super::numa;
use super::slab::{SlabPool, SlabPoolStats};
use super::{class_index, NUM_SIZE_CLASSES, SIZE_CLASSES};
use crate::memory::Buffer;
use parking_lot::RwLock;
use std::sync::Arc;

/// Pool manager configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Free buffers cached per (node, class) before spilling to the
    /// allocator.
    pub max_cached_per_class: usize,

    /// NUMA node count override; `None` detects the machine topology.
    pub numa_nodes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_cached_per_class: 128,
            numa_nodes: None,
        }
    }
}

type ClassSlots = [Option<Arc<SlabPool>>; NUM_SIZE_CLASSES];

/// Rectangular map (NUMA node, size class) -> `SlabPool`, lazily populated.
///
/// Creation of a missing pool takes the node's write lock once; every
/// subsequent lookup for that (node, class) is a read-lock clone, so the
/// hot path never blocks after warmup.
pub struct PoolManager {
    nodes: Vec<RwLock<ClassSlots>>,
    max_cached: usize,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let node_count = config.numa_nodes.unwrap_or_else(numa::node_count).max(1);
        let nodes = (0..node_count)
            .map(|_| RwLock::new(std::array::from_fn(|_| None)))
            .collect();
        Arc::new(Self {
            nodes,
            max_cached: config.max_cached_per_class,
        })
    }

    /// Number of NUMA nodes this manager fans out over.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The unique pool for (resolved node, smallest class >= size).
    pub fn get_pool(&self, size: usize, numa_hint: i32) -> Arc<SlabPool> {
        let node = numa::resolve_hint(numa_hint).min(self.nodes.len() - 1);
        let class = class_index(size);

        if let Some(pool) = &self.nodes[node].read()[class] {
            return pool.clone();
        }

        let mut slots = self.nodes[node].write();
        slots[class]
            .get_or_insert_with(|| SlabPool::new(SIZE_CLASSES[class], node, self.max_cached))
            .clone()
    }

    /// Allocate a buffer of `size` observable bytes near `numa_hint`.
    pub fn get(&self, size: usize, numa_hint: i32) -> Buffer {
        self.get_pool(size, numa_hint).get(size)
    }

    /// Snapshot of every instantiated pool.
    pub fn stats(&self) -> Vec<SlabPoolStats> {
        let mut out = Vec::new();
        for node in &self.nodes {
            for slot in node.read().iter().flatten() {
                out.push(slot.stats());
            }
        }
        out
    }

    /// Buffers currently outstanding across all pools.
    pub fn outstanding(&self) -> u64 {
        self.stats()
            .iter()
            .map(|s| s.total_alloc - s.total_free)
            .sum()
    }
}
