//! Paged bump allocator with rewindable cursors.
//!
//! Memory is bumped out of fixed-size pages. A [`StackCursor`] marks the
//! current position; restoring it releases everything allocated after it.
//! Cursors may be restored in any order. A cursor that is not the most
//! recent one is only marked free, and the stack pointer rewinds once the
//! chain of free cursors at the top collapses back to a live one.
//!
//! Allocations larger than one page bypass the pages and are freed
//! individually when the cursor that precedes them is released.

use std::{alloc::Layout, cell::RefCell, marker::PhantomData, ptr::NonNull};

use tracing::warn;

use crate::os::OsApi;

/// Size of one stack page in bytes.
pub const PAGE_SIZE: usize = 4096;

const PAGE_ALIGN: usize = 16;

/// Handle to a position on a [`StackAllocator`].
///
/// Cursors are plain handles. Restoring the same cursor twice is detected
/// and panics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackCursor {
    slot: u32,
    generation: u32,
}

#[derive(Clone, Copy, Debug)]
struct CursorSlot {
    page: usize,
    sp: usize,
    large_len: usize,
    generation: u32,
    is_free: bool,
}

#[derive(Default)]
struct StackState {
    pages: Vec<NonNull<u8>>,
    /// Index of the page currently bumped into.
    page: usize,
    /// Offset within the current page.
    sp: usize,
    large: Vec<(NonNull<u8>, Layout)>,
    /// Cursor chain, oldest first. The last slot is the tail cursor.
    slots: Vec<CursorSlot>,
    /// Cursors taken and not yet restored.
    outstanding: usize,
    next_generation: u32,
}

/// LIFO scratch allocator for per-iteration state.
pub struct StackAllocator {
    state: RefCell<StackState>,
    os: OsApi,
}

// SAFETY: the allocator owns its pages; moving it to another thread moves
// every outstanding allocation with it.
unsafe impl Send for StackAllocator {}

/// A slice of `Copy` values living on a [`StackAllocator`].
///
/// Valid until the cursor taken before it was allocated is restored.
pub struct StackSlice<'a, T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    _stack: PhantomData<&'a StackAllocator>,
}

impl<T: Copy> StackSlice<'_, T> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr points to `len` initialized values, see `alloc_slice`
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: ptr points to `len` initialized values and the slice is
        // uniquely owned by this handle
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> std::ops::Deref for StackSlice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy> std::ops::DerefMut for StackSlice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl StackAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_os(OsApi::system())
    }

    #[must_use]
    pub fn with_os(os: OsApi) -> Self {
        Self {
            state: RefCell::new(StackState::default()),
            os,
        }
    }

    fn page_layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_ALIGN)
            .unwrap_or_else(|_| unreachable!("page layout is constant"))
    }

    /// Allocate uninitialized memory for `layout`.
    ///
    /// The memory stays valid until a cursor taken before this call is
    /// restored, or the allocator is dropped.
    #[must_use]
    pub fn alloc(&self, layout: Layout) -> NonNull<u8> {
        let mut state = self.state.borrow_mut();

        if layout.size() > PAGE_SIZE || layout.align() > PAGE_ALIGN {
            let ptr = self.os.malloc(layout);
            state.large.push((ptr, layout));
            return ptr;
        }

        if state.pages.is_empty() {
            state.pages.push(self.os.malloc(Self::page_layout()));
        }

        let mut offset = state.sp.next_multiple_of(layout.align());
        if offset + layout.size() > PAGE_SIZE {
            state.page += 1;
            if state.page == state.pages.len() {
                state.pages.push(self.os.malloc(Self::page_layout()));
            }
            offset = 0;
        }
        state.sp = offset + layout.size();

        // SAFETY: offset + size fits inside the page
        unsafe { state.pages[state.page].add(offset) }
    }

    /// Allocate `len` copies of `value`.
    ///
    /// # Panics
    ///
    /// Panics if the slice size overflows `isize`.
    #[must_use]
    pub fn alloc_slice<T: Copy>(&self, len: usize, value: T) -> StackSlice<'_, T> {
        let ptr = if len == 0 || size_of::<T>() == 0 {
            NonNull::dangling()
        } else {
            let layout = Layout::array::<T>(len)
                .unwrap_or_else(|_| panic!("stack slice of {len} elements overflows"));
            let ptr = self.alloc(layout).cast::<T>();
            for i in 0..len {
                // SAFETY: the allocation holds `len` values of T
                unsafe { ptr.add(i).write(value) };
            }
            ptr
        };

        StackSlice {
            ptr,
            len,
            _stack: PhantomData,
        }
    }

    /// Mark the current position.
    #[must_use]
    pub fn get_cursor(&self) -> StackCursor {
        let mut state = self.state.borrow_mut();
        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);

        let slot = CursorSlot {
            page: state.page,
            sp: state.sp,
            large_len: state.large.len(),
            generation,
            is_free: false,
        };
        let index = state.slots.len() as u32;
        state.slots.push(slot);
        state.outstanding += 1;

        StackCursor {
            slot: index,
            generation,
        }
    }

    /// Release a cursor.
    ///
    /// # Panics
    ///
    /// Panics if the cursor was already restored.
    ///
    /// # Safety
    ///
    /// No [`StackSlice`] or pointer allocated after `cursor` was taken may be
    /// used once the stack rewinds past it.
    pub unsafe fn restore_cursor(&self, cursor: StackCursor) {
        let mut state = self.state.borrow_mut();

        let index = cursor.slot as usize;
        let live = state
            .slots
            .get(index)
            .is_some_and(|slot| slot.generation == cursor.generation && !slot.is_free);
        assert!(live, "stack cursor restored twice");

        state.slots[index].is_free = true;
        state.outstanding -= 1;

        // Only the tail cursor can rewind the stack.
        if index + 1 != state.slots.len() {
            return;
        }

        let mut first = index;
        while first > 0 && state.slots[first - 1].is_free {
            first -= 1;
        }

        let rewind = state.slots[first];
        state.slots.truncate(first);
        state.page = rewind.page;
        state.sp = rewind.sp;

        let released: Vec<_> = state.large.drain(rewind.large_len..).collect();
        drop(state);
        for (ptr, layout) in released {
            // SAFETY: large allocations were obtained from `os` with `layout`
            unsafe { self.os.free(ptr, layout) };
        }
    }

    /// Number of cursors taken and not yet restored.
    #[must_use]
    pub fn outstanding_cursors(&self) -> usize {
        self.state.borrow().outstanding
    }

    /// Current `(page, offset)` of the stack pointer.
    #[must_use]
    pub fn position(&self) -> (usize, usize) {
        let state = self.state.borrow();
        (state.page, state.sp)
    }

    /// Number of pages allocated so far. Pages are reused, never freed early.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.borrow().pages.len()
    }

    /// Number of live allocations that bypassed the pages.
    #[must_use]
    pub fn large_count(&self) -> usize {
        self.state.borrow().large.len()
    }

    /// Rewind to the very bottom.
    ///
    /// # Panics
    ///
    /// Panics if cursors are still outstanding.
    pub fn reset(&mut self) {
        let state = self.state.get_mut();
        assert_eq!(state.outstanding, 0, "stack reset with live cursors");
        state.slots.clear();
        state.page = 0;
        state.sp = 0;
        for (ptr, layout) in state.large.drain(..) {
            // SAFETY: large allocations were obtained from `os` with `layout`
            unsafe { self.os.free(ptr, layout) };
        }
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.outstanding != 0 {
            warn!(
                outstanding = state.outstanding,
                "stack allocator dropped with live cursors"
            );
        }

        for (ptr, layout) in state.large.drain(..) {
            // SAFETY: large allocations were obtained from `os` with `layout`
            unsafe { self.os.free(ptr, layout) };
        }
        for page in state.pages.drain(..) {
            // SAFETY: pages were obtained from `os` with the page layout
            unsafe { self.os.free(page, Self::page_layout()) };
        }
    }
}

impl std::fmt::Debug for StackAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("StackAllocator")
            .field("pages", &state.pages.len())
            .field("page", &state.page)
            .field("sp", &state.sp)
            .field("outstanding", &state.outstanding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn restore(stack: &StackAllocator, cursor: StackCursor) {
        // SAFETY: tests never touch memory after restoring
        unsafe { stack.restore_cursor(cursor) };
    }

    #[test]
    fn test_nested_cursors_rewind() {
        let stack = StackAllocator::new();
        let _ = stack.alloc(Layout::new::<u64>());
        let start = stack.position();

        let outer = stack.get_cursor();
        let _ = stack.alloc_slice(10, 0u32);
        let inner = stack.get_cursor();
        let _ = stack.alloc_slice(10, 0u64);

        restore(&stack, inner);
        restore(&stack, outer);
        assert_eq!(stack.position(), start);
        assert_eq!(stack.outstanding_cursors(), 0);
    }

    #[test]
    fn test_out_of_order_release_waits_for_chain() {
        let stack = StackAllocator::new();
        let start = stack.position();

        let a = stack.get_cursor();
        let _ = stack.alloc_slice(8, 1u8);
        let b = stack.get_cursor();
        let _ = stack.alloc_slice(8, 2u8);
        let after_b = stack.position();

        restore(&stack, a);
        // `b` is still live, nothing is released yet.
        assert_eq!(stack.position(), after_b);

        restore(&stack, b);
        assert_eq!(stack.position(), start);
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let stack = StackAllocator::new();
        let cursor = stack.get_cursor();
        let mut a = stack.alloc_slice(3, 0u8);
        let mut b = stack.alloc_slice(4, 0u64);
        a.as_mut_slice().copy_from_slice(&[1, 2, 3]);
        b.as_mut_slice().copy_from_slice(&[4, 5, 6, 7]);
        assert_eq!(b.as_ptr() as usize % align_of::<u64>(), 0);
        assert_eq!(&*a, &[1, 2, 3]);
        assert_eq!(&*b, &[4, 5, 6, 7]);
        restore(&stack, cursor);
    }

    #[test]
    fn test_spills_onto_new_page_and_reuses_it() {
        let stack = StackAllocator::new();
        let cursor = stack.get_cursor();
        for _ in 0..4 {
            let _ = stack.alloc(Layout::from_size_align(PAGE_SIZE / 2 + 1, 8).unwrap());
        }
        assert_eq!(stack.page_count(), 4);
        restore(&stack, cursor);

        let cursor = stack.get_cursor();
        for _ in 0..4 {
            let _ = stack.alloc(Layout::from_size_align(PAGE_SIZE / 2 + 1, 8).unwrap());
        }
        assert_eq!(stack.page_count(), 4);
        restore(&stack, cursor);
    }

    #[test]
    fn test_large_allocation_is_released_with_cursor() {
        let stack = StackAllocator::new();
        let cursor = stack.get_cursor();
        let _ = stack.alloc(Layout::from_size_align(PAGE_SIZE * 3, 8).unwrap());
        assert_eq!(stack.large_count(), 1);
        assert_eq!(stack.page_count(), 0);
        restore(&stack, cursor);
        assert_eq!(stack.large_count(), 0);
    }

    #[test]
    #[should_panic(expected = "stack cursor restored twice")]
    fn test_double_restore_panics() {
        let stack = StackAllocator::new();
        let a = stack.get_cursor();
        let _b = stack.get_cursor();
        restore(&stack, a);
        restore(&stack, a);
    }

    #[test]
    #[should_panic(expected = "stack cursor restored twice")]
    fn test_restore_after_collapse_panics() {
        let stack = StackAllocator::new();
        let a = stack.get_cursor();
        restore(&stack, a);
        let _b = stack.get_cursor();
        restore(&stack, a);
    }

    proptest! {
        #[test]
        fn test_any_release_order_balances(order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle()) {
            let stack = StackAllocator::new();
            let _ = stack.alloc(Layout::new::<u32>());
            let start = stack.position();

            let cursors: Vec<_> = (0..8)
                .map(|i| {
                    let cursor = stack.get_cursor();
                    let _ = stack.alloc_slice(100 + i * 37, 0u8);
                    cursor
                })
                .collect();

            for i in order {
                restore(&stack, cursors[i]);
            }

            prop_assert_eq!(stack.position(), start);
            prop_assert_eq!(stack.outstanding_cursors(), 0);
        }
    }
}
