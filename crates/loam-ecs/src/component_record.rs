//! Per-id index of the tables that contain an id.
//!
//! Every id in use has a [`ComponentRecord`]. Besides exact ids, the
//! wildcard forms `(R, *)`, `(*, T)`, `(*, *)`, `*` and `_` have their own
//! records whose caches are the union of the matching exact records, so a
//! wildcard lookup only visits tables that actually match.

use bitflags::bitflags;
use loam_collections::Map;

use crate::{
    component::ComponentInfo,
    entity::Entity,
    id::{CHILD_OF, Id},
    ordered_children::OrderedChildren,
    sparse::SparseStorage,
    table::TableId,
    table_cache::TableCache,
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ComponentRecordFlags: u32 {
        const IS_WILDCARD = 1 << 0;
        const IS_PAIR = 1 << 1;
        const HAS_TYPE_INFO = 1 << 2;
        /// Values live in a sparse set instead of table columns.
        const SPARSE = 1 << 3;
        /// The relationship can be walked by up/down traversal.
        const TRAVERSABLE = 1 << 4;
        /// Instances see the component of their `IsA` base.
        const INHERITABLE = 1 << 5;
        /// At most one target per entity.
        const EXCLUSIVE = 1 << 6;
        /// `(ChildOf, P)` record.
        const IS_CHILD_OF = 1 << 7;
        /// `(ChildOf, P)` record whose parent keeps an explicit child order.
        const ORDERED_CHILDREN = 1 << 8;
    }
}

/// Location of an id in one table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableRecord {
    /// First index in the table type that matches the record's id.
    pub index: u16,
    /// Number of type entries that match. Always 1 for exact ids.
    pub count: u16,
    /// Data column of the entry at `index`, if it has one.
    pub column: Option<u16>,
}

/// Index entry for one id.
#[derive(Debug)]
pub struct ComponentRecord {
    id: Id,
    pub(crate) flags: ComponentRecordFlags,
    pub(crate) cache: TableCache<TableRecord>,
    pub(crate) type_info: Option<ComponentInfo>,
    pub(crate) sparse: Option<SparseStorage>,
    pub(crate) ordered: Option<OrderedChildren>,
}

impl ComponentRecord {
    /// New record. Flags derived from the id itself are added here; trait
    /// flags come from the caller.
    #[must_use]
    pub fn new(id: Id, mut flags: ComponentRecordFlags, type_info: Option<ComponentInfo>) -> Self {
        if id.is_pair() {
            flags |= ComponentRecordFlags::IS_PAIR;
            if id.first() == CHILD_OF.index() && !id.is_wildcard() {
                flags |= ComponentRecordFlags::IS_CHILD_OF;
            }
        }
        if id.is_wildcard() {
            flags |= ComponentRecordFlags::IS_WILDCARD;
        }
        if type_info.is_some() {
            flags |= ComponentRecordFlags::HAS_TYPE_INFO;
        }

        let sparse = flags
            .contains(ComponentRecordFlags::SPARSE)
            .then(|| SparseStorage::new(type_info.clone()));

        Self {
            id,
            flags,
            cache: TableCache::new(),
            type_info,
            sparse,
            ordered: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Id {
        self.id
    }

    #[must_use]
    pub const fn flags(&self) -> ComponentRecordFlags {
        self.flags
    }

    #[must_use]
    pub const fn cache(&self) -> &TableCache<TableRecord> {
        &self.cache
    }

    #[must_use]
    pub fn table_record(&self, table: TableId) -> Option<&TableRecord> {
        self.cache.get(table)
    }

    #[must_use]
    pub const fn type_info(&self) -> Option<&ComponentInfo> {
        self.type_info.as_ref()
    }

    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        self.flags.contains(ComponentRecordFlags::SPARSE)
    }

    #[must_use]
    pub const fn sparse(&self) -> Option<&SparseStorage> {
        self.sparse.as_ref()
    }

    #[must_use]
    pub const fn ordered_children(&self) -> Option<&OrderedChildren> {
        self.ordered.as_ref()
    }

    /// Whether any table, empty or not, contains the id.
    #[must_use]
    pub const fn in_use(&self) -> bool {
        !self.cache.is_empty()
    }
}

/// All component records, keyed by id.
#[derive(Debug, Default)]
pub struct ComponentIndex {
    records: Map<ComponentRecord>,
}

impl ComponentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: Id) -> Option<&ComponentRecord> {
        self.records.get(id.raw())
    }

    #[must_use]
    pub fn get_mut(&mut self, id: Id) -> Option<&mut ComponentRecord> {
        self.records.get_mut(id.raw())
    }

    #[must_use]
    pub fn contains(&self, id: Id) -> bool {
        self.records.contains(id.raw())
    }

    /// The record for `id`, created with `f` if missing.
    pub fn ensure_with(&mut self, id: Id, f: impl FnOnce() -> ComponentRecord) -> &mut ComponentRecord {
        self.records.ensure_with(id.raw(), f)
    }

    pub fn remove(&mut self, id: Id) -> Option<ComponentRecord> {
        self.records.remove(id.raw())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ComponentRecord> {
        self.records.values_mut()
    }

    /// Ids of all records.
    #[must_use]
    pub fn ids(&self) -> Vec<Id> {
        self.records.keys().map(Id::from_raw).collect()
    }

    /// Move `child` between the ordered lists of its old and new parent.
    /// Parents that do not keep an order are ignored.
    pub fn reparent(&mut self, child: Entity, old: Option<Entity>, new: Option<Entity>) {
        if old == new {
            return;
        }
        if let Some(old) = old {
            self.unparent(child, old);
        }
        if let Some(ordered) = new.and_then(|new| self.ordered_mut(new)) {
            ordered.push(child);
        }
    }

    /// Remove `child` from the ordered list of `parent`.
    pub fn unparent(&mut self, child: Entity, parent: Entity) {
        if let Some(ordered) = self.ordered_mut(parent) {
            ordered.remove(child);
        }
    }

    fn ordered_mut(&mut self, parent: Entity) -> Option<&mut OrderedChildren> {
        self.records
            .get_mut(Id::pair(CHILD_OF, parent).raw())?
            .ordered
            .as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::WILDCARD;

    #[test]
    fn test_flags_from_id() {
        let parent = Entity::from_index(100);
        let record = ComponentRecord::new(Id::pair(CHILD_OF, parent), Default::default(), None);
        assert!(record.flags().contains(ComponentRecordFlags::IS_PAIR | ComponentRecordFlags::IS_CHILD_OF));
        assert!(!record.flags().contains(ComponentRecordFlags::IS_WILDCARD));

        let record = ComponentRecord::new(Id::pair(CHILD_OF, WILDCARD), Default::default(), None);
        assert!(record.flags().contains(ComponentRecordFlags::IS_WILDCARD));
        assert!(!record.flags().contains(ComponentRecordFlags::IS_CHILD_OF));
    }

    #[test]
    fn test_sparse_record_owns_storage() {
        let record = ComponentRecord::new(
            Entity::from_index(50).id(),
            ComponentRecordFlags::SPARSE,
            Some(ComponentInfo::of::<u32>()),
        );
        assert!(record.is_sparse());
        assert!(record.sparse().is_some());
        assert!(record.flags().contains(ComponentRecordFlags::HAS_TYPE_INFO));
    }

    #[test]
    fn test_reparent_moves_between_ordered_lists() {
        let p1 = Entity::from_index(100);
        let p2 = Entity::from_index(101);
        let child = Entity::from_index(200);

        let mut index = ComponentIndex::new();
        for parent in [p1, p2] {
            let id = Id::pair(CHILD_OF, parent);
            index
                .ensure_with(id, || ComponentRecord::new(id, Default::default(), None))
                .ordered = Some(OrderedChildren::new());
        }

        index.reparent(child, None, Some(p1));
        index.reparent(child, Some(p1), Some(p2));
        let get = |index: &ComponentIndex, parent| {
            index
                .get(Id::pair(CHILD_OF, parent))
                .and_then(ComponentRecord::ordered_children)
                .map(OrderedChildren::to_vec)
        };
        assert_eq!(get(&index, p1), Some(vec![]));
        assert_eq!(get(&index, p2), Some(vec![child]));

        index.unparent(child, p2);
        assert_eq!(get(&index, p2), Some(vec![]));
    }
}
