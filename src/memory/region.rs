// Platform byte regions backing pool buffers.
//
// Regions come from the cheapest suitable source: heap allocations (64-byte
// aligned) for sub-hugepage sizes, 2 MiB-aligned anonymous mappings with a
// MAP_HUGETLB attempt on Linux, VirtualAllocExNuma on Windows. The heap is
// the universal fallback, so allocation never fails under memory pressure;
// if the heap itself is exhausted the process aborts.

use crate::concurrent::CACHE_LINE_SIZE;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Huge page size (2MB)
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

enum RegionKind {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Mmap { mapped: usize },
    #[cfg(windows)]
    VirtualAlloc,
}

/// An owned, fixed-size byte region with a NUMA placement preference.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    kind: RegionKind,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate a region of exactly `len` bytes preferring `numa_node`.
    pub fn alloc(len: usize, numa_node: usize) -> Self {
        debug_assert!(len > 0);

        #[cfg(target_os = "linux")]
        if len >= HUGE_PAGE_SIZE {
            if let Some(region) = Self::alloc_mmap(len) {
                return region;
            }
        }

        #[cfg(windows)]
        if let Some(region) = Self::alloc_virtual_numa(len, numa_node) {
            return region;
        }

        #[cfg(not(windows))]
        let _ = numa_node;

        Self::alloc_heap(len)
    }

    fn alloc_heap(len: usize) -> Self {
        let layout = Layout::from_size_align(len, CACHE_LINE_SIZE)
            .unwrap_or_else(|_| handle_alloc_error(Layout::new::<u8>()));
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        Self {
            ptr,
            len,
            kind: RegionKind::Heap(layout),
        }
    }

    #[cfg(target_os = "linux")]
    fn alloc_mmap(len: usize) -> Option<Self> {
        // Round to a whole number of huge pages so the mapping is
        // 2 MiB-aligned and hugepage-eligible.
        let mapped = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

        unsafe {
            let mut raw = libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                // No reserved huge pages; take a normal mapping and ask the
                // kernel for transparent promotion.
                raw = libc::mmap(
                    std::ptr::null_mut(),
                    mapped,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if raw == libc::MAP_FAILED {
                    return None;
                }
                libc::madvise(raw, mapped, libc::MADV_HUGEPAGE);
            }
            Some(Self {
                ptr: NonNull::new_unchecked(raw as *mut u8),
                len,
                kind: RegionKind::Mmap { mapped },
            })
        }
    }

    #[cfg(windows)]
    fn alloc_virtual_numa(len: usize, numa_node: usize) -> Option<Self> {
        use windows_sys::Win32::System::Memory::{
            VirtualAllocExNuma, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
        };
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        let raw = unsafe {
            VirtualAllocExNuma(
                GetCurrentProcess(),
                std::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
                numa_node as u32,
            )
        };
        NonNull::new(raw as *mut u8).map(|ptr| Self {
            ptr,
            len,
            kind: RegionKind::VirtualAlloc,
        })
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.kind {
            RegionKind::Heap(layout) => unsafe {
                dealloc(self.ptr.as_ptr(), layout);
            },
            #[cfg(target_os = "linux")]
            RegionKind::Mmap { mapped } => unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, mapped);
            },
            #[cfg(windows)]
            RegionKind::VirtualAlloc => unsafe {
                use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
                VirtualFree(self.ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_is_writable() {
        let region = Region::alloc(4096, 0);
        assert_eq!(region.len(), 4096);
        unsafe {
            std::ptr::write_bytes(region.as_ptr(), 0xAB, 4096);
            assert_eq!(*region.as_ptr(), 0xAB);
            assert_eq!(*region.as_ptr().add(4095), 0xAB);
        }
    }

    #[test]
    fn test_alignment() {
        for size in [64usize, 2048, 65536] {
            let region = Region::alloc(size, 0);
            assert_eq!(region.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        }
    }

    #[test]
    fn test_large_region() {
        // Exercises the mmap path on Linux, VirtualAlloc on Windows.
        let region = Region::alloc(HUGE_PAGE_SIZE, 0);
        assert_eq!(region.len(), HUGE_PAGE_SIZE);
        unsafe {
            std::ptr::write_bytes(region.as_ptr(), 0x42, HUGE_PAGE_SIZE);
        }
    }
}
