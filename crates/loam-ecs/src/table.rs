//! Tables - columnar storage for all entities of one type.
//!
//! A table is identified by its type, the sorted list of ids its entities
//! have. Each id with data gets a column; tags and sparse components only
//! appear in the type. Rows are moved between tables with
//! [`Table::move_row`] when an entity's type changes.

use std::{cell::Cell, cmp::Ordering, fmt};

use bitflags::bitflags;
use loam_collections::Allocator;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    component::ComponentInfo,
    component_record::TableRecord,
    entity::Entity,
    id::{ANY, Id, WILDCARD},
    query::OrderByFn,
    storage::Column,
};

/// Unique identifier for a table. Ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);

impl TableId {
    /// The table with the empty type.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

bitflags! {
    /// Properties derived from the type when a table is created.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TableFlags: u32 {
        const HAS_CHILD_OF = 1 << 0;
        const HAS_IS_A = 1 << 1;
        const HAS_PAIRS = 1 << 2;
        /// Some entity in the table is the target of a traversable
        /// relationship.
        const HAS_TRAVERSABLE = 1 << 3;
        /// The parent keeps an explicit child order.
        const HAS_ORDERED_CHILDREN = 1 << 4;
        const IS_PREFAB = 1 << 5;
        const IS_DISABLED = 1 << 6;
        const HAS_SPARSE = 1 << 7;
    }
}

/// Storage for all entities with the same type.
pub struct Table {
    id: TableId,
    /// Sorted list of ids in this table.
    type_: Box<[Id]>,
    flags: TableFlags,
    columns: Box<[Column]>,
    /// Type index to column index.
    column_map: Box<[Option<u16>]>,
    /// Column index to type index.
    column_types: Box<[u16]>,
    entities: Vec<Entity>,
    /// Change counters. Index 0 tracks the entity set, `column + 1` each
    /// column.
    dirty: Box<[Cell<u32>]>,
    traversable_count: u32,
    /// Target of the table's `ChildOf` pair.
    parent: Option<Entity>,
    pub(crate) add_edges: FxHashMap<Id, TableId>,
    pub(crate) remove_edges: FxHashMap<Id, TableId>,
    /// Ids of the component records this table is registered with.
    pub(crate) records: Box<[Id]>,
}

impl Table {
    /// Create a table. `column_infos` holds the component info for every
    /// type index that gets a column.
    #[must_use]
    pub fn new(
        id: TableId,
        type_: Box<[Id]>,
        column_infos: Vec<(usize, ComponentInfo)>,
        flags: TableFlags,
        parent: Option<Entity>,
    ) -> Self {
        debug_assert!(type_.windows(2).all(|w| w[0] < w[1]), "type must be sorted");

        let mut column_map = vec![None; type_.len()].into_boxed_slice();
        let mut column_types = Vec::with_capacity(column_infos.len());
        let mut columns = Vec::with_capacity(column_infos.len());
        for (column, (type_index, info)) in column_infos.into_iter().enumerate() {
            column_map[type_index] = Some(column as u16);
            column_types.push(type_index as u16);
            columns.push(Column::new(info));
        }

        let dirty = (0..=columns.len()).map(|_| Cell::new(1)).collect();

        Self {
            id,
            type_,
            flags,
            columns: columns.into_boxed_slice(),
            column_map,
            column_types: column_types.into_boxed_slice(),
            entities: Vec::new(),
            dirty,
            traversable_count: 0,
            parent,
            add_edges: FxHashMap::default(),
            remove_edges: FxHashMap::default(),
            records: Box::new([]),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// Sorted ids of this table.
    #[must_use]
    pub fn type_ids(&self) -> &[Id] {
        &self.type_
    }

    #[must_use]
    pub const fn flags(&self) -> TableFlags {
        self.flags
    }

    pub(crate) fn set_flag(&mut self, flag: TableFlags, value: bool) {
        self.flags.set(flag, value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[must_use]
    pub const fn parent(&self) -> Option<Entity> {
        self.parent
    }

    /// Index of `id` in the type.
    #[must_use]
    pub fn type_index(&self, id: Id) -> Option<usize> {
        self.type_.binary_search(&id).ok()
    }

    #[must_use]
    pub fn has(&self, id: Id) -> bool {
        self.type_index(id).is_some()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column of the id at a type index.
    #[must_use]
    pub fn column_of_index(&self, type_index: usize) -> Option<usize> {
        self.column_map.get(type_index).copied().flatten().map(usize::from)
    }

    /// Column storing `id`.
    #[must_use]
    pub fn column_of(&self, id: Id) -> Option<usize> {
        self.column_of_index(self.type_index(id)?)
    }

    #[must_use]
    pub fn column(&self, column: usize) -> &Column {
        &self.columns[column]
    }

    /// Id stored in a column.
    #[must_use]
    pub fn column_id(&self, column: usize) -> Id {
        self.type_[usize::from(self.column_types[column])]
    }

    /// Raw pointer to the value in `column` at `row`.
    #[must_use]
    pub fn ptr(&self, column: usize, row: u32) -> *mut u8 {
        assert!((row as usize) < self.len(), "row {row} out of bounds");
        // SAFETY: row is in bounds
        unsafe { self.columns[column].get_unchecked_raw(row as usize) }
    }

    /// Change counters; index 0 is the entity set, `column + 1` a column.
    #[must_use]
    pub fn dirty_state(&self) -> &[Cell<u32>] {
        &self.dirty
    }

    #[must_use]
    pub fn dirty_counter(&self, column: Option<usize>) -> u32 {
        self.dirty[column.map_or(0, |c| c + 1)].get()
    }

    /// Bump the counter of one column.
    pub fn mark_dirty(&self, column: usize) {
        let counter = &self.dirty[column + 1];
        counter.set(counter.get().wrapping_add(1));
    }

    fn mark_entities_dirty(&self) {
        let counter = &self.dirty[0];
        counter.set(counter.get().wrapping_add(1));
    }

    fn mark_all_dirty(&self) {
        for counter in &*self.dirty {
            counter.set(counter.get().wrapping_add(1));
        }
    }

    #[must_use]
    pub const fn traversable_count(&self) -> u32 {
        self.traversable_count
    }

    /// Track entities that are targets of a traversable relationship.
    pub(crate) fn add_traversable(&mut self, delta: i32) {
        self.traversable_count = self.traversable_count.saturating_add_signed(delta);
        self.flags
            .set(TableFlags::HAS_TRAVERSABLE, self.traversable_count > 0);
    }

    /// Append a row for `entity`, default-constructing every column except
    /// `skip`.
    ///
    /// # Safety
    ///
    /// Every constructed column must have a constructor, and the caller must
    /// initialize the slot of `skip` before it is read or dropped.
    pub(crate) unsafe fn append(
        &mut self,
        alloc: &mut Allocator,
        entity: Entity,
        skip: Option<Id>,
    ) -> u32 {
        let row = self.entities.len() as u32;
        self.entities.push(entity);
        for (column, col) in self.columns.iter_mut().enumerate() {
            let slot = col.push_uninit(alloc);
            if Some(self.type_[usize::from(self.column_types[column])]) != skip {
                // SAFETY: the caller checked for a constructor
                let constructed = unsafe { col.info().construct(slot) };
                debug_assert!(constructed);
            }
        }
        self.mark_all_dirty();
        row
    }

    /// Move the row of an entity from `src` to `dst`.
    ///
    /// Columns in both tables are moved bitwise, columns only in `src` are
    /// dropped and columns only in `dst` are default-constructed, except
    /// `skip`, which is left for the caller to write.
    ///
    /// Returns the row in `dst` and the entity that was swapped into
    /// `src_row`, if any.
    ///
    /// # Safety
    ///
    /// Every constructed `dst` column must have a constructor, and the caller
    /// must initialize the slot of `skip` before it is read or dropped.
    pub(crate) unsafe fn move_row(
        alloc: &mut Allocator,
        src: &mut Table,
        src_row: u32,
        dst: &mut Table,
        skip: Option<Id>,
    ) -> (u32, Option<Entity>) {
        let row = src_row as usize;
        assert!(row < src.len(), "row {src_row} out of bounds");

        let entity = src.entities[row];
        let dst_row = dst.entities.len() as u32;
        dst.entities.push(entity);

        for (column, col) in dst.columns.iter_mut().enumerate() {
            let id = dst.type_[usize::from(dst.column_types[column])];
            match src.column_of(id) {
                Some(src_column) => {
                    // SAFETY: row is in bounds of the source column; the
                    // source slot is forgotten below
                    unsafe { col.push_raw(alloc, src.columns[src_column].get_unchecked_raw(row)) };
                }
                None => {
                    let slot = col.push_uninit(alloc);
                    if Some(id) != skip {
                        // SAFETY: the caller checked for a constructor
                        let constructed = unsafe { col.info().construct(slot) };
                        debug_assert!(constructed);
                    }
                }
            }
        }

        for (column, col) in src.columns.iter_mut().enumerate() {
            let id = src.type_[usize::from(src.column_types[column])];
            // SAFETY: row is in bounds
            unsafe {
                if dst.column_of(id).is_some() {
                    col.swap_remove_forget(row);
                } else {
                    col.swap_remove_drop(row);
                }
            }
        }

        src.entities.swap_remove(row);
        let swapped = src.entities.get(row).copied();

        src.mark_all_dirty();
        dst.mark_all_dirty();
        (dst_row, swapped)
    }

    /// Drop a row. Returns the entity that was swapped into `row`, if any.
    pub(crate) fn delete_row(&mut self, row: u32) -> Option<Entity> {
        let row = row as usize;
        assert!(row < self.len(), "row {row} out of bounds");
        for col in &mut *self.columns {
            // SAFETY: row is in bounds
            unsafe { col.swap_remove_drop(row) };
        }
        self.entities.swap_remove(row);
        self.mark_all_dirty();
        self.entities.get(row).copied()
    }

    /// Append a row for `entity` copied from `row`, or default-constructed
    /// when `copy` is false.
    ///
    /// # Safety
    ///
    /// Every column must support the requested operation (clone or
    /// construct).
    pub(crate) unsafe fn clone_row(
        &mut self,
        alloc: &mut Allocator,
        row: u32,
        entity: Entity,
        copy: bool,
    ) -> u32 {
        if !copy {
            // SAFETY: forwarded to the caller
            return unsafe { self.append(alloc, entity, None) };
        }
        let dst_row = self.entities.len() as u32;
        self.entities.push(entity);
        for col in &mut *self.columns {
            let cloned = col.push_clone(alloc, row as usize);
            debug_assert!(cloned);
        }
        self.mark_all_dirty();
        dst_row
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for col in &mut *self.columns {
            // SAFETY: both rows are in bounds
            unsafe { col.swap(a, b) };
        }
        self.entities.swap(a, b);
    }

    /// Sort rows by the values in `column` using `compare`, then by entity.
    /// Without a column or comparator rows are sorted by entity only.
    /// Returns whether any row moved; the caller updates entity records.
    ///
    /// # Safety
    ///
    /// `compare` must accept values of the component type of `column`.
    pub(crate) unsafe fn sort_rows(&mut self, column: Option<usize>, compare: Option<OrderByFn>) -> bool {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            let by_value = match (column, compare) {
                (Some(column), Some(compare)) => {
                    // SAFETY: both rows are in bounds; the caller vouches for
                    // the comparator
                    unsafe { compare(self.ptr(column, a as u32), self.ptr(column, b as u32)) }
                }
                _ => Ordering::Equal,
            };
            by_value.then_with(|| self.entities[a].cmp(&self.entities[b]))
        });
        if order.iter().enumerate().all(|(row, &src)| row == src) {
            return false;
        }

        // `at[r]` is the current row of original row `r`, `orig[c]` the
        // original row now at `c`
        let mut at: Vec<usize> = (0..order.len()).collect();
        let mut orig = at.clone();
        for (row, &src) in order.iter().enumerate() {
            let current = at[src];
            if current != row {
                self.swap_rows(row, current);
                orig.swap(row, current);
                at[orig[row]] = row;
                at[orig[current]] = current;
            }
        }
        self.mark_all_dirty();
        true
    }

    /// Drop all rows and release column buffers.
    pub(crate) fn fini(&mut self, alloc: &mut Allocator) {
        for col in &mut *self.columns {
            col.fini(alloc);
        }
        self.entities.clear();
        self.mark_entities_dirty();
    }

    pub fn add_edge(&self, id: Id) -> Option<TableId> {
        self.add_edges.get(&id).copied()
    }

    pub fn remove_edge(&self, id: Id) -> Option<TableId> {
        self.remove_edges.get(&id).copied()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("type", &self.type_)
            .field("flags", &self.flags)
            .field("len", &self.entities.len())
            .finish_non_exhaustive()
    }
}

/// Component records a table with type `type_` registers with, in order:
/// one per id, then `(R, *)` per relationship, `(*, T)` per target, `*`
/// for plain ids, `(*, *)` for pairs and `_` for any non-empty type.
#[must_use]
pub fn table_records(type_: &[Id], column_of: impl Fn(usize) -> Option<usize>) -> Vec<(Id, TableRecord)> {
    let record = |index: usize, count: usize| TableRecord {
        index: index as u16,
        count: count as u16,
        column: column_of(index).map(|c| c as u16),
    };

    let mut records: Vec<(Id, TableRecord)> =
        type_.iter().enumerate().map(|(i, &id)| (id, record(i, 1))).collect();

    let first_pair = type_.iter().position(|id| id.is_pair()).unwrap_or(type_.len());
    let pairs = &type_[first_pair..];

    let mut i = 0;
    while i < pairs.len() {
        let rel = pairs[i].first();
        let count = pairs[i..].iter().take_while(|id| id.first() == rel).count();
        records.push((
            Id::pair_from_indices(rel, WILDCARD.index()),
            record(first_pair + i, count),
        ));
        i += count;
    }

    let mut targets: SmallVec<[(u32, usize, usize); 8]> = SmallVec::new();
    for (i, id) in pairs.iter().enumerate() {
        match targets.iter_mut().find(|(tgt, _, _)| *tgt == id.second()) {
            Some((_, _, count)) => *count += 1,
            None => targets.push((id.second(), first_pair + i, 1)),
        }
    }
    for (tgt, index, count) in targets {
        records.push((Id::pair_from_indices(WILDCARD.index(), tgt), record(index, count)));
    }

    if first_pair > 0 {
        records.push((WILDCARD.id(), record(0, first_pair)));
    }
    if !pairs.is_empty() {
        records.push((Id::pair(WILDCARD, WILDCARD), record(first_pair, pairs.len())));
    }
    if !type_.is_empty() {
        records.push((ANY.id(), record(0, 1)));
    }
    records
}
