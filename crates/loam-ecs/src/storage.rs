//! Component storage - type-erased column storage for tables.
//!
//! Each column stores components of a single type in a contiguous array,
//! enabling cache-friendly iteration. Buffers come from the world's
//! [`Allocator`], so every operation that can allocate takes it explicitly.

use std::{alloc::Layout, ptr::NonNull};

use loam_collections::Allocator;

use crate::component::ComponentInfo;

/// A column of components of a single, non-zero-sized type.
///
/// Dropping a column drops its values but cannot return the buffer, which
/// belongs to an [`Allocator`]. Call [`fini`](Self::fini) to release both.
pub struct Column {
    /// Pointer to the data array.
    data: NonNull<u8>,
    /// Number of components stored.
    len: usize,
    /// Allocated capacity (in number of components).
    capacity: usize,
    /// Component type information.
    info: ComponentInfo,
}

impl Column {
    /// Create a new empty column for the given component type.
    #[must_use]
    pub fn new(info: ComponentInfo) -> Self {
        debug_assert!(info.size() != 0, "zero-sized components have no column");
        Self {
            data: NonNull::dangling(),
            len: 0,
            capacity: 0,
            info,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn info(&self) -> &ComponentInfo {
        &self.info
    }

    /// Reserve capacity for at least `additional` more components.
    pub fn reserve(&mut self, alloc: &mut Allocator, additional: usize) {
        let required = self.len + additional;
        if required > self.capacity {
            self.grow(alloc, required);
        }
    }

    /// Grow the column to at least `min_capacity`.
    fn grow(&mut self, alloc: &mut Allocator, min_capacity: usize) {
        // Growth strategy: double capacity, but at least 4 elements
        let new_capacity = (self.capacity * 2).max(min_capacity).max(4);
        let new_layout = self.array_layout(new_capacity);

        self.data = if self.capacity == 0 {
            alloc.alloc(new_layout)
        } else {
            let old_layout = self.array_layout(self.capacity);
            // SAFETY: data was allocated from `alloc` with old_layout
            unsafe { alloc.realloc(self.data, old_layout, new_layout) }
        };
        self.capacity = new_capacity;
    }

    /// Append an uninitialized slot and return a pointer to it.
    ///
    /// The caller must initialize the slot before it is read or dropped.
    pub fn push_uninit(&mut self, alloc: &mut Allocator) -> *mut u8 {
        self.reserve(alloc, 1);
        self.len += 1;
        // SAFETY: len - 1 is within capacity
        unsafe { self.get_unchecked_raw(self.len - 1) }
    }

    /// Push a component by copying its bytes.
    ///
    /// # Safety
    ///
    /// - `value` must point to a valid instance of the column's component type.
    /// - Ownership moves into the column; the caller must not drop `value`.
    pub unsafe fn push_raw(&mut self, alloc: &mut Allocator, value: *const u8) {
        let dst = self.push_uninit(alloc);
        // SAFETY: dst is a fresh slot, value is valid, and they don't overlap
        unsafe { std::ptr::copy_nonoverlapping(value, dst, self.info.size()) };
    }

    /// Push a typed component onto the column.
    pub fn push<T: 'static>(&mut self, alloc: &mut Allocator, value: T) {
        debug_assert!(self.info.is::<T>(), "Type mismatch in Column::push");
        let value = std::mem::ManuallyDrop::new(value);
        // SAFETY: the type matches and the value is not dropped here
        unsafe { self.push_raw(alloc, std::ptr::from_ref(&*value).cast()) };
    }

    /// Append a copy of the value at `row`. Returns `false`, leaving the
    /// column unchanged, if the type cannot be cloned.
    pub fn push_clone(&mut self, alloc: &mut Allocator, row: usize) -> bool {
        assert!(row < self.len, "Index out of bounds in push_clone");
        if !self.info.can_clone() {
            return false;
        }
        self.reserve(alloc, 1);
        // SAFETY: both indices are in capacity and distinct, row is initialized
        unsafe {
            let src = self.get_unchecked_raw(row);
            let dst = self.get_unchecked_raw(self.len);
            self.info.clone_into(src, dst);
        }
        self.len += 1;
        true
    }

    /// Move the last element into `index` after the value at `index` was
    /// dropped or moved out. Returns the old index of the moved element.
    fn fill_hole(&mut self, index: usize) -> Option<usize> {
        self.len -= 1;
        if index < self.len {
            // SAFETY: both indices are valid and distinct
            unsafe {
                let last = self.get_unchecked_raw(self.len);
                let hole = self.get_unchecked_raw(index);
                std::ptr::copy_nonoverlapping(last, hole, self.info.size());
            }
            Some(self.len)
        } else {
            None
        }
    }

    /// Remove and drop the component at the given index.
    /// Swaps with the last element for O(1) removal.
    ///
    /// Returns the index of the element that was swapped into `index`,
    /// or `None` if `index` was the last element.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    pub unsafe fn swap_remove_drop(&mut self, index: usize) -> Option<usize> {
        debug_assert!(index < self.len, "Index out of bounds in swap_remove_drop");
        // SAFETY: caller ensures index is valid
        unsafe { self.info.drop_in_place(self.get_unchecked_raw(index)) };
        self.fill_hole(index)
    }

    /// Remove the component at `index` without dropping it. Used after the
    /// value was moved somewhere else.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`, and the value must have been moved
    /// out already.
    pub unsafe fn swap_remove_forget(&mut self, index: usize) -> Option<usize> {
        debug_assert!(index < self.len, "Index out of bounds in swap_remove_forget");
        self.fill_hole(index)
    }

    /// Swap the values at two indices.
    ///
    /// # Safety
    ///
    /// Both indices must be less than `len`.
    pub unsafe fn swap(&mut self, a: usize, b: usize) {
        debug_assert!(a < self.len && b < self.len, "Index out of bounds in swap");
        if a == b {
            return;
        }
        // SAFETY: distinct in-bounds slots of `size` bytes each
        unsafe {
            std::ptr::swap_nonoverlapping(self.get_unchecked_raw(a), self.get_unchecked_raw(b), self.info.size());
        }
    }

    /// Get a raw pointer to the component at the given index.
    ///
    /// # Safety
    ///
    /// `index` must be less than `capacity`.
    #[must_use]
    pub unsafe fn get_unchecked_raw(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: caller ensures index is valid
        unsafe { self.data.as_ptr().add(index * self.info.size()) }
    }

    /// Get a reference to the component at the given index.
    ///
    /// # Safety
    ///
    /// - `index` must be less than `len`.
    /// - `T` must match the column's component type.
    #[must_use]
    pub unsafe fn get_unchecked<T: 'static>(&self, index: usize) -> &T {
        debug_assert!(self.info.is::<T>(), "Type mismatch in Column::get");
        // SAFETY: caller ensures index is valid and type matches
        unsafe { &*self.get_unchecked_raw(index).cast::<T>() }
    }

    /// Get a mutable reference to the component at the given index.
    ///
    /// # Safety
    ///
    /// - `index` must be less than `len`.
    /// - `T` must match the column's component type.
    #[must_use]
    pub unsafe fn get_unchecked_mut<T: 'static>(&mut self, index: usize) -> &mut T {
        debug_assert!(self.info.is::<T>(), "Type mismatch in Column::get_mut");
        // SAFETY: caller ensures index is valid and type matches
        unsafe { &mut *self.get_unchecked_raw(index).cast::<T>() }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// The column as a typed slice.
    ///
    /// # Safety
    ///
    /// `T` must match the column's component type.
    #[must_use]
    pub unsafe fn as_slice<T: 'static>(&self) -> &[T] {
        debug_assert!(self.info.is::<T>());
        // SAFETY: the first len elements are initialized values of T
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast::<T>(), self.len) }
    }

    /// Clear all components, dropping them.
    pub fn clear(&mut self) {
        if self.info.needs_drop() {
            for i in 0..self.len {
                // SAFETY: i is a valid index holding an initialized value
                unsafe { self.info.drop_in_place(self.get_unchecked_raw(i)) };
            }
        }
        self.len = 0;
    }

    /// Drop all values and return the buffer to `alloc`.
    pub fn fini(&mut self, alloc: &mut Allocator) {
        self.clear();
        if self.capacity > 0 {
            let layout = self.array_layout(self.capacity);
            // SAFETY: data was allocated from `alloc` with this layout
            unsafe { alloc.free(self.data, layout) };
            self.data = NonNull::dangling();
            self.capacity = 0;
        }
    }

    /// Calculate the array layout for `count` components.
    fn array_layout(&self, count: usize) -> Layout {
        let size = self.info.size() * count;
        // SAFETY: align comes from a valid Layout and is a power of two
        unsafe { Layout::from_size_align_unchecked(size, self.info.align()) }
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("type", &self.info.name())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::TypeHooks;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Name(String);

    #[test]
    fn test_column_push_get() {
        let mut alloc = Allocator::new();
        let mut col = Column::new(ComponentInfo::of::<Position>());

        col.push(&mut alloc, Position { x: 1.0, y: 2.0 });
        col.push(&mut alloc, Position { x: 3.0, y: 4.0 });
        assert_eq!(col.len(), 2);

        // SAFETY: valid indices and correct type
        unsafe {
            assert_eq!(col.get_unchecked::<Position>(0), &Position { x: 1.0, y: 2.0 });
            assert_eq!(col.as_slice::<Position>()[1], Position { x: 3.0, y: 4.0 });
        }
        col.fini(&mut alloc);
        assert_eq!(alloc.block(32).outstanding(), 0);
    }

    #[test]
    fn test_column_swap_remove() {
        let mut alloc = Allocator::new();
        let mut col = Column::new(ComponentInfo::of::<Position>());

        col.push(&mut alloc, Position { x: 1.0, y: 2.0 });
        col.push(&mut alloc, Position { x: 3.0, y: 4.0 });
        col.push(&mut alloc, Position { x: 5.0, y: 6.0 });

        // SAFETY: index 0 is valid
        let swapped = unsafe { col.swap_remove_drop(0) };
        assert_eq!(swapped, Some(2));
        assert_eq!(col.len(), 2);

        // SAFETY: valid indices
        unsafe {
            assert_eq!(col.get_unchecked::<Position>(0), &Position { x: 5.0, y: 6.0 });
            assert_eq!(col.get_unchecked::<Position>(1), &Position { x: 3.0, y: 4.0 });
            assert_eq!(col.swap_remove_drop(1), None);
        }
        col.fini(&mut alloc);
    }

    #[test]
    fn test_column_growth_moves_across_size_classes() {
        let mut alloc = Allocator::new();
        let mut col = Column::new(ComponentInfo::of::<u64>());
        for i in 0..1000u64 {
            col.push(&mut alloc, i);
        }
        // SAFETY: the column holds u64 values
        let values = unsafe { col.as_slice::<u64>() };
        assert!(values.iter().copied().eq(0..1000));
        col.fini(&mut alloc);
        assert_eq!(alloc.large_count(), 0);
    }

    #[test]
    fn test_column_with_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter(#[allow(dead_code)] u8);

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut alloc = Allocator::new();
        let mut col = Column::new(ComponentInfo::of::<DropCounter>());
        col.push(&mut alloc, DropCounter(0));
        col.push(&mut alloc, DropCounter(1));
        col.push(&mut alloc, DropCounter(2));
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 0);

        // SAFETY: index 1 is valid and its value was "moved out"
        unsafe { col.swap_remove_forget(1) };
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 0);

        col.fini(&mut alloc);
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_column_clone_requires_hook() {
        let mut alloc = Allocator::new();
        let mut col = Column::new(ComponentInfo::of::<Name>());
        col.push(&mut alloc, Name("Hello".to_string()));
        assert!(!col.push_clone(&mut alloc, 0));
        col.fini(&mut alloc);

        let mut info = ComponentInfo::of::<Name>();
        info.set_hooks(TypeHooks::of::<Name>().with_clone::<Name>());
        let mut col = Column::new(info);
        col.push(&mut alloc, Name("World".to_string()));
        assert!(col.push_clone(&mut alloc, 0));
        // SAFETY: valid indices and correct type
        unsafe { assert_eq!(col.get_unchecked::<Name>(1).0, "World") };
        col.fini(&mut alloc);
    }
}
