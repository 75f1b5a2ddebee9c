// Lock-free slab pool: one size class bound to one NUMA node.
//
// Free buffers are cached on a Treiber stack whose head packs a 16-bit
// version tag above the 48-bit pointer, so a stalled pop cannot ABA its way
// onto a node that was popped, reused, and re-pushed in the meantime.
// Direct frees (cache overflow) go through epoch-deferred destruction
// because a concurrent pop may still dereference the node's link field.
//
// Reference: "Systems Programming: Coping with Parallelism" by R.K. Treiber
// (1986) for the stack; tag-versioned head per the usual ABA defence.

use super::buffer::{Buffer, BufferInner};
use super::region::Region;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

const TAG_SHIFT: u32 = 48;
const PTR_MASK: u64 = (1u64 << TAG_SHIFT) - 1;

#[inline]
fn pack(ptr: *mut BufferInner, tag: u64) -> u64 {
    let addr = ptr as u64;
    debug_assert_eq!(addr & !PTR_MASK, 0, "pointer exceeds 48 bits");
    addr | (tag << TAG_SHIFT)
}

#[inline]
fn unpack(word: u64) -> (*mut BufferInner, u64) {
    ((word & PTR_MASK) as *mut BufferInner, word >> TAG_SHIFT)
}

/// Counters exposed by a pool. `total_alloc - total_free` is the number of
/// buffers currently outstanding.
#[derive(Debug, Clone, Copy)]
pub struct SlabPoolStats {
    pub class_size: usize,
    pub numa_node: usize,
    pub total_alloc: u64,
    pub total_free: u64,
    pub cached: usize,
}

/// Cache of free buffers for one (size class, NUMA node) pair.
pub struct SlabPool {
    class_size: usize,
    numa_node: usize,
    max_cached: usize,
    /// Tagged Treiber head: (version << 48) | node pointer.
    head: AtomicU64,
    cached: AtomicUsize,
    total_alloc: AtomicU64,
    total_free: AtomicU64,
    /// Handed to every buffer as its back-pointer.
    self_weak: Weak<SlabPool>,
}

impl SlabPool {
    pub(crate) fn new(class_size: usize, numa_node: usize, max_cached: usize) -> Arc<Self> {
        debug_assert!(class_size.is_power_of_two());
        Arc::new_cyclic(|weak| Self {
            class_size,
            numa_node,
            max_cached,
            head: AtomicU64::new(0),
            cached: AtomicUsize::new(0),
            total_alloc: AtomicU64::new(0),
            total_free: AtomicU64::new(0),
            self_weak: weak.clone(),
        })
    }

    /// Size class capacity in bytes.
    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }

    /// NUMA node all buffers of this pool prefer.
    #[inline]
    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    /// Get a buffer whose observable length is `request` (clamped to the
    /// class capacity for oversize requests routed to the largest class).
    /// Never fails: a cache miss allocates a fresh region, falling back to
    /// the heap under memory pressure.
    pub fn get(&self, request: usize) -> Buffer {
        let len = request.min(self.class_size);
        self.total_alloc.fetch_add(1, Ordering::Relaxed);

        if let Some(node) = self.pop_free() {
            unsafe {
                let inner = &mut *node.as_ptr();
                inner.len = len;
                inner.refcount.store(1, Ordering::Relaxed);
                inner.next.store(std::ptr::null_mut(), Ordering::Relaxed);
            }
            return Buffer::from_inner(node);
        }

        let inner = Box::new(BufferInner {
            region: Region::alloc(self.class_size, self.numa_node),
            len,
            numa_node: self.numa_node,
            refcount: AtomicUsize::new(1),
            pool: self.self_weak.clone(),
            next: AtomicPtr::new(std::ptr::null_mut()),
        });
        Buffer::from_inner(unsafe { NonNull::new_unchecked(Box::into_raw(inner)) })
    }

    fn pop_free(&self) -> Option<NonNull<BufferInner>> {
        let guard = crossbeam::epoch::pin();
        loop {
            let word = self.head.load(Ordering::Acquire);
            let (ptr, tag) = unpack(word);
            if ptr.is_null() {
                return None;
            }
            // The node cannot be reclaimed while we are pinned, so the
            // link read is safe even if a racing pop wins the CAS.
            let next = unsafe { (*ptr).next.load(Ordering::Acquire) };
            let replacement = pack(next, tag.wrapping_add(1) & 0xFFFF);
            if self
                .head
                .compare_exchange_weak(word, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.cached.fetch_sub(1, Ordering::Relaxed);
                drop(guard);
                return Some(unsafe { NonNull::new_unchecked(ptr) });
            }
        }
    }

    /// Return a released buffer node to the cache, or free it when the
    /// cache is at `max_cached`. Called with exclusive ownership of the
    /// node (the last handle just dropped).
    pub(crate) fn recycle(&self, node: *mut BufferInner) {
        self.total_free.fetch_add(1, Ordering::Relaxed);

        if self.cached.load(Ordering::Relaxed) >= self.max_cached {
            self.free_deferred(node);
            return;
        }

        loop {
            let word = self.head.load(Ordering::Acquire);
            let (head_ptr, tag) = unpack(word);
            unsafe {
                (*node).next.store(head_ptr, Ordering::Relaxed);
            }
            let replacement = pack(node, tag.wrapping_add(1) & 0xFFFF);
            if self
                .head
                .compare_exchange_weak(word, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.cached.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Destroy a node once no pinned thread can still be reading its link
    /// field.
    fn free_deferred(&self, node: *mut BufferInner) {
        let addr = node as usize;
        let guard = crossbeam::epoch::pin();
        unsafe {
            guard.defer_unchecked(move || {
                drop(Box::from_raw(addr as *mut BufferInner));
            });
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SlabPoolStats {
        SlabPoolStats {
            class_size: self.class_size,
            numa_node: self.numa_node,
            total_alloc: self.total_alloc.load(Ordering::Relaxed),
            total_free: self.total_free.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
        }
    }

    /// Buffers currently held by callers.
    pub fn outstanding(&self) -> u64 {
        let stats = self.stats();
        stats.total_alloc - stats.total_free
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        // Exclusive access: drain the free list and drop every node.
        let (mut ptr, _) = unpack(*self.head.get_mut());
        while !ptr.is_null() {
            unsafe {
                let node = Box::from_raw(ptr);
                ptr = node.next.load(Ordering::Relaxed);
            }
        }
    }
}
