//! Sparse-set storage for components that do not fragment tables' columns.
//!
//! The id stays in the table type so queries still find the table, but the
//! values live here, keyed by entity index, and never move when the entity
//! changes table.

use loam_collections::Allocator;

use crate::{component::ComponentInfo, entity::Entity, storage::Column};

const EMPTY: u32 = u32::MAX;

/// Dense entity list plus a sparse `entity index -> dense index` array.
#[derive(Debug)]
pub struct SparseStorage {
    dense: Vec<Entity>,
    sparse: Vec<u32>,
    /// Values, parallel to `dense`. `None` for sparse tags.
    column: Option<Column>,
}

impl SparseStorage {
    #[must_use]
    pub fn new(info: Option<ComponentInfo>) -> Self {
        Self {
            dense: Vec::new(),
            sparse: Vec::new(),
            column: info.filter(|info| info.size() != 0).map(Column::new),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.dense
    }

    #[must_use]
    pub fn info(&self) -> Option<&ComponentInfo> {
        self.column.as_ref().map(Column::info)
    }

    fn dense_index(&self, entity: Entity) -> Option<usize> {
        let dense = *self.sparse.get(entity.index() as usize)?;
        (dense != EMPTY && self.dense[dense as usize] == entity).then_some(dense as usize)
    }

    #[must_use]
    pub fn contains(&self, entity: Entity) -> bool {
        self.dense_index(entity).is_some()
    }

    /// Pointer to the value of `entity`, if it has one.
    #[must_use]
    pub fn get(&self, entity: Entity) -> Option<*mut u8> {
        let dense = self.dense_index(entity)?;
        let column = self.column.as_ref()?;
        // SAFETY: dense indices are always below the column length
        Some(unsafe { column.get_unchecked_raw(dense) })
    }

    /// Make room for `entity`. Returns the value slot (for data components)
    /// and whether the entity was newly inserted. A new slot is
    /// uninitialized and must be written by the caller.
    pub fn ensure(&mut self, alloc: &mut Allocator, entity: Entity) -> (Option<*mut u8>, bool) {
        if self.dense_index(entity).is_some() {
            return (self.get(entity), false);
        }

        let index = entity.index() as usize;
        if index >= self.sparse.len() {
            self.sparse.resize(index + 1, EMPTY);
        }
        self.sparse[index] = self.dense.len() as u32;
        self.dense.push(entity);
        let slot = self.column.as_mut().map(|column| column.push_uninit(alloc));
        (slot, true)
    }

    /// Drop the value of `entity` and forget it. Returns `false` if absent.
    pub fn remove(&mut self, entity: Entity) -> bool {
        let Some(dense) = self.dense_index(entity) else {
            return false;
        };

        if let Some(column) = self.column.as_mut() {
            // SAFETY: dense is a valid, initialized index
            unsafe { column.swap_remove_drop(dense) };
        }
        self.dense.swap_remove(dense);
        if let Some(&moved) = self.dense.get(dense) {
            self.sparse[moved.index() as usize] = dense as u32;
        }
        self.sparse[entity.index() as usize] = EMPTY;
        true
    }

    pub fn fini(&mut self, alloc: &mut Allocator) {
        if let Some(column) = self.column.as_mut() {
            column.fini(alloc);
        }
        self.dense.clear();
        self.sparse.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut alloc = Allocator::new();
        let mut set = SparseStorage::new(Some(ComponentInfo::of::<u32>()));
        let a = Entity::from_index(10);
        let b = Entity::from_index(3);

        for (entity, value) in [(a, 1u32), (b, 2)] {
            let (slot, inserted) = set.ensure(&mut alloc, entity);
            assert!(inserted);
            // SAFETY: fresh slot for a u32
            unsafe { slot.unwrap().cast::<u32>().write(value) };
        }
        assert!(!set.ensure(&mut alloc, a).1);

        assert!(set.remove(a));
        assert!(!set.contains(a));
        assert!(!set.remove(a));
        // SAFETY: b holds a u32
        assert_eq!(unsafe { *set.get(b).unwrap().cast::<u32>() }, 2);
        assert_eq!(set.entities(), &[b]);
        set.fini(&mut alloc);
    }

    #[test]
    fn test_tags_have_no_values() {
        let mut alloc = Allocator::new();
        let mut set = SparseStorage::new(None);
        let e = Entity::from_index(1);
        assert_eq!(set.ensure(&mut alloc, e), (None, true));
        assert!(set.contains(e));
        assert!(set.get(e).is_none());
    }

    #[test]
    fn test_stale_generation_is_absent() {
        let mut alloc = Allocator::new();
        let mut set = SparseStorage::new(None);
        let old = Entity::from_index(5);
        set.ensure(&mut alloc, old);
        let new = Entity::new(5, old.generation().next());
        assert!(!set.contains(new));
    }
}
