//! Injected allocation primitives.

use std::{
    alloc::{Layout, handle_alloc_error},
    fmt,
    ptr::NonNull,
};

/// Raw allocation function, same contract as [`std::alloc::alloc`].
pub type AllocFn = unsafe fn(Layout) -> *mut u8;

/// Raw deallocation function, same contract as [`std::alloc::dealloc`].
pub type DeallocFn = unsafe fn(*mut u8, Layout);

/// The set of primitive memory operations the allocators call into.
///
/// Defaults to the global Rust allocator. Tests and embedders swap in their
/// own functions to count or pool OS-level requests.
#[derive(Clone, Copy)]
pub struct OsApi {
    pub alloc: AllocFn,
    pub alloc_zeroed: AllocFn,
    pub dealloc: DeallocFn,
}

impl OsApi {
    /// Primitives backed by the global allocator.
    #[must_use]
    pub const fn system() -> Self {
        Self {
            alloc: std::alloc::alloc,
            alloc_zeroed: std::alloc::alloc_zeroed,
            dealloc: std::alloc::dealloc,
        }
    }

    /// Allocate memory for `layout`. Aborts on out-of-memory.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `layout` has zero size.
    #[must_use]
    pub fn malloc(&self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.size() != 0, "zero-sized OS allocation");
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { (self.alloc)(layout) };
        NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout))
    }

    /// Allocate zeroed memory for `layout`. Aborts on out-of-memory.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `layout` has zero size.
    #[must_use]
    pub fn calloc(&self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.size() != 0, "zero-sized OS allocation");
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { (self.alloc_zeroed)(layout) };
        NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout))
    }

    /// Return memory obtained from [`malloc`](Self::malloc) or
    /// [`calloc`](Self::calloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this api with the same `layout`.
    pub unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded to the caller
        unsafe { (self.dealloc)(ptr.as_ptr(), layout) }
    }
}

impl Default for OsApi {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for OsApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsApi").finish_non_exhaustive()
    }
}
