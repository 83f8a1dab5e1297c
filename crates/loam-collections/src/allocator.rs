//! Size-class allocator built from block allocators.

use std::{alloc::Layout, ptr::NonNull};

use tracing::trace;

use crate::{
    block::{BLOCK_SIZE, BlockAllocator, CHUNK_ALIGN},
    map::Map,
    os::OsApi,
};

/// Set of [`BlockAllocator`]s keyed by 16-byte size class.
///
/// Requests up to [`BLOCK_SIZE`] bytes with an alignment of at most
/// [`CHUNK_ALIGN`] are served from the matching size class. Anything larger
/// or more strictly aligned goes straight to the OS api.
#[derive(Debug, Default)]
pub struct Allocator {
    classes: Map<BlockAllocator>,
    os: OsApi,
    /// Live allocations that bypassed the size classes.
    large: usize,
}

impl Allocator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_os(OsApi::system())
    }

    #[must_use]
    pub fn with_os(os: OsApi) -> Self {
        Self {
            classes: Map::new(),
            os,
            large: 0,
        }
    }

    /// Size class serving `layout`, or `None` for a direct OS allocation.
    fn class_of(layout: Layout) -> Option<usize> {
        (layout.size() <= BLOCK_SIZE && layout.align() <= CHUNK_ALIGN)
            .then(|| layout.size().next_multiple_of(CHUNK_ALIGN))
    }

    /// The block allocator for chunks of `size` bytes, created on demand.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn block(&mut self, size: usize) -> &mut BlockAllocator {
        let class = size.next_multiple_of(CHUNK_ALIGN);
        let os = self.os;
        self.classes
            .ensure_with(class as u64, || BlockAllocator::with_os(class, os))
    }

    /// Number of size classes in use.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of live allocations that went directly to the OS.
    #[must_use]
    pub const fn large_count(&self) -> usize {
        self.large
    }

    /// Allocate memory for `layout`.
    ///
    /// # Panics
    ///
    /// Panics if `layout` has zero size.
    #[must_use]
    pub fn alloc(&mut self, layout: Layout) -> NonNull<u8> {
        assert!(layout.size() != 0, "zero-sized allocation");
        match Self::class_of(layout) {
            Some(class) => self.block(class).alloc(),
            None => {
                self.large += 1;
                trace!(size = layout.size(), "large allocation");
                self.os.malloc(layout)
            }
        }
    }

    /// Free memory returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with the same `layout`.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, layout: Layout) {
        match Self::class_of(layout) {
            // SAFETY: forwarded to the caller
            Some(class) => unsafe { self.block(class).free(ptr) },
            None => {
                self.large -= 1;
                // SAFETY: forwarded to the caller
                unsafe { self.os.free(ptr, layout) };
            }
        }
    }

    /// Resize an allocation, moving it to a new size class when needed.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with `old`, and `old` and `new`
    /// must have the same alignment.
    #[must_use]
    pub unsafe fn realloc(&mut self, ptr: NonNull<u8>, old: Layout, new: Layout) -> NonNull<u8> {
        debug_assert_eq!(old.align(), new.align());

        match (Self::class_of(old), Self::class_of(new)) {
            (Some(from), Some(to)) if from == to => ptr,
            (Some(from), Some(to)) => {
                // Detach the source class so both allocators can be borrowed.
                let Some(mut src) = self.classes.remove(from as u64) else {
                    unreachable!("size class {from} missing for live allocation");
                };
                let dst = self.block(to);
                // SAFETY: ptr is a live chunk of `src`
                let moved = unsafe { BlockAllocator::realloc(dst, &mut src, Some(ptr)) };
                self.classes.insert(from as u64, src);
                moved
            }
            _ => {
                let moved = self.alloc(new);
                // SAFETY: both regions hold at least the smaller size
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ptr.as_ptr(),
                        moved.as_ptr(),
                        old.size().min(new.size()),
                    );
                    self.free(ptr, old);
                }
                moved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_requests_share_a_class() {
        let mut a = Allocator::new();
        let p = a.alloc(Layout::from_size_align(20, 4).unwrap());
        let q = a.alloc(Layout::from_size_align(30, 8).unwrap());
        assert_eq!(a.class_count(), 1);
        assert_eq!(a.block(32).outstanding(), 2);
        // SAFETY: allocated above with these layouts
        unsafe {
            a.free(p, Layout::from_size_align(20, 4).unwrap());
            a.free(q, Layout::from_size_align(30, 8).unwrap());
        }
        assert_eq!(a.block(32).outstanding(), 0);
    }

    #[test]
    fn test_large_and_overaligned_bypass_classes() {
        let mut a = Allocator::new();
        let big = Layout::from_size_align(BLOCK_SIZE * 2, 8).unwrap();
        let aligned = Layout::from_size_align(64, 64).unwrap();
        let p = a.alloc(big);
        let q = a.alloc(aligned);
        assert_eq!(a.large_count(), 2);
        assert_eq!(a.class_count(), 0);
        assert_eq!(q.as_ptr() as usize % 64, 0);
        // SAFETY: allocated above with these layouts
        unsafe {
            a.free(p, big);
            a.free(q, aligned);
        }
        assert_eq!(a.large_count(), 0);
    }

    #[test]
    fn test_realloc_across_classes_preserves_bytes() {
        let mut a = Allocator::new();
        let small = Layout::from_size_align(16, 4).unwrap();
        let medium = Layout::from_size_align(64, 4).unwrap();
        let huge = Layout::from_size_align(BLOCK_SIZE * 4, 4).unwrap();

        let p = a.alloc(small);
        // SAFETY: p holds 16 bytes
        unsafe { p.as_ptr().copy_from_nonoverlapping([3u8; 16].as_ptr(), 16) };

        // SAFETY: p is live with `small`
        let q = unsafe { a.realloc(p, small, medium) };
        assert_eq!(a.block(16).outstanding(), 0);
        assert_eq!(a.block(64).outstanding(), 1);

        // SAFETY: q is live with `medium`
        let r = unsafe { a.realloc(q, medium, huge) };
        assert_eq!(a.block(64).outstanding(), 0);
        assert_eq!(a.large_count(), 1);

        // SAFETY: r holds at least 16 copied bytes
        let bytes = unsafe { std::slice::from_raw_parts(r.as_ptr(), 16) };
        assert_eq!(bytes, &[3u8; 16]);
        // SAFETY: r is live with `huge`
        unsafe { a.free(r, huge) };
    }
}
