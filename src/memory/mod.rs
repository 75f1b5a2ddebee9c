// NUMA-aware slab buffer pool.
//
// Buffers are carved from size-classed regions and recycled through
// lock-free free lists, one pool per (NUMA node, size class). The receive
// and send paths draw every byte they touch from here; steady-state
// traffic allocates nothing.

pub mod buffer;
pub mod numa;
pub mod pool_manager;
pub mod region;
pub mod slab;

pub use buffer::{alloc_unpooled, Buffer};
pub use pool_manager::{PoolConfig, PoolManager};
pub use region::{Region, HUGE_PAGE_SIZE};
pub use slab::{SlabPool, SlabPoolStats};

/// Fixed size-class table: powers of two from 2 KiB to 1 MiB.
pub const SIZE_CLASSES: [usize; 10] = [
    2 * 1024,
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
    1024 * 1024,
];

pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Index of the smallest class >= `size`; oversize requests map to the
/// largest class.
#[inline]
pub fn class_index(size: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .position(|&c| c >= size)
        .unwrap_or(NUM_SIZE_CLASSES - 1)
}

/// Capacity of the class serving `size`.
#[inline]
pub fn size_class_for(size: usize) -> usize {
    SIZE_CLASSES[class_index(size)]
}
