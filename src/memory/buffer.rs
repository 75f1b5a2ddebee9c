// Reference-counted, pool-returning byte buffers.
//
// A `Buffer` is an owning handle over a `Region` carved out by a
// `SlabPool`. Cloning increments the reference count; the last drop either
// pushes the backing node onto its originating pool's free list or, for
// one-shot allocations, frees the region outright. The back-pointer check
// makes returning a buffer to a foreign pool impossible by construction.

use super::region::Region;
use super::slab::SlabPool;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Weak;

/// Shared state behind a `Buffer` handle. Also serves as the intrusive
/// free-list node while cached in a `SlabPool`.
pub(crate) struct BufferInner {
    pub(crate) region: Region,
    /// Observable length: exactly what the caller requested, never the
    /// size-class capacity.
    pub(crate) len: usize,
    pub(crate) numa_node: usize,
    pub(crate) refcount: AtomicUsize,
    /// Originating pool; dangling (`Weak::new`) for one-shot allocations.
    pub(crate) pool: Weak<SlabPool>,
    /// Free-list link, meaningful only while cached.
    pub(crate) next: AtomicPtr<BufferInner>,
}

impl BufferInner {
    /// Called by the last `Buffer` drop. The node is exclusively owned at
    /// this point.
    pub(crate) unsafe fn release(ptr: *mut BufferInner) {
        match (*ptr).pool.upgrade() {
            Some(pool) => pool.recycle(ptr),
            None => drop(Box::from_raw(ptr)),
        }
    }
}

/// Owning, reference-counted view over a pooled byte region.
pub struct Buffer {
    inner: NonNull<BufferInner>,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn from_inner(inner: NonNull<BufferInner>) -> Self {
        Self { inner }
    }

    #[inline]
    fn inner(&self) -> &BufferInner {
        unsafe { self.inner.as_ref() }
    }

    /// Observable length in bytes (the originally requested size).
    #[inline]
    pub fn len(&self) -> usize {
        self.inner().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the backing size class.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner().region.len()
    }

    /// NUMA node the backing region prefers.
    #[inline]
    pub fn numa_node(&self) -> usize {
        self.inner().numa_node
    }

    /// Current reference count (inherently racy; for accounting probes).
    pub fn refcount(&self) -> usize {
        self.inner().refcount.load(Ordering::Relaxed)
    }

    /// Mutable view over the full observable length. Requires a unique
    /// handle: writing through a shared buffer would race with readers.
    #[inline]
    pub fn bytes(&mut self) -> &mut [u8] {
        debug_assert_eq!(
            self.refcount(),
            1,
            "mutable access to a shared buffer"
        );
        unsafe { std::slice::from_raw_parts_mut(self.inner().region.as_ptr(), self.len()) }
    }

    /// Read-only view over the observable length.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.inner().region.as_ptr(), self.len()) }
    }

    /// Non-owning sub-view `[lo, hi)` tied to this handle's borrow.
    #[inline]
    pub fn slice(&self, lo: usize, hi: usize) -> &[u8] {
        &self.as_slice()[lo..hi]
    }

    /// Shrink the observable length. The connection receive path uses this
    /// after a short read so decode never sees stale bytes.
    pub fn truncate(&mut self, len: usize) {
        debug_assert_eq!(self.refcount(), 1, "resizing a shared buffer");
        if len < self.len() {
            unsafe {
                self.inner.as_mut().len = len;
            }
        }
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.inner().refcount.fetch_add(1, Ordering::Relaxed);
        Self { inner: self.inner }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.inner().refcount.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe {
                BufferInner::release(self.inner.as_ptr());
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("numa_node", &self.numa_node())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Allocate a one-shot buffer with no pool affinity. The last release
/// frees the region directly.
pub fn alloc_unpooled(len: usize, numa_node: usize) -> Buffer {
    let inner = Box::new(BufferInner {
        region: Region::alloc(len.max(1), numa_node),
        len,
        numa_node,
        refcount: AtomicUsize::new(1),
        pool: Weak::new(),
        next: AtomicPtr::new(std::ptr::null_mut()),
    });
    Buffer::from_inner(unsafe { NonNull::new_unchecked(Box::into_raw(inner)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpooled_lifecycle() {
        let mut buf = alloc_unpooled(100, 0);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.refcount(), 1);

        buf.bytes().fill(0x7F);
        assert!(buf.as_slice().iter().all(|&b| b == 0x7F));

        let clone = buf.clone();
        assert_eq!(buf.refcount(), 2);
        drop(clone);
        assert_eq!(buf.refcount(), 1);
    }

    #[test]
    fn test_slice_view() {
        let mut buf = alloc_unpooled(10, 0);
        for (i, b) in buf.bytes().iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(buf.slice(2, 5), &[2, 3, 4]);
        assert_eq!(buf.slice(0, 10).len(), 10);
    }

    #[test]
    fn test_truncate() {
        let mut buf = alloc_unpooled(64, 0);
        buf.truncate(16);
        assert_eq!(buf.len(), 16);
        // Growing back is not permitted.
        buf.truncate(32);
        assert_eq!(buf.len(), 16);
    }
}
