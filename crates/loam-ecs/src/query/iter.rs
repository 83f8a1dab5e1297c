//! Query iteration and typed field access.

use std::{any::type_name, cell::Cell, ops::Index};

use loam_collections::StackCursor;

use crate::{
    World,
    component::Component,
    entity::Entity,
    error::{EcsError, EcsResult},
    id::Id,
    query::{InOut, Query, cache::QueryCache, compiler::QueryFlags, engine::RunContext},
    sparse::SparseStorage,
    table::Table,
};

/// Iterator over the results of a query.
///
/// Each call to [`next`](Self::next) moves to the next result: a range of
/// rows in one table (`$this`) plus the location of every field. Fields are
/// borrowed from the iterator, so they cannot outlive the current result.
pub struct QueryIter<'w> {
    ctx: RunContext<'w>,
    cursor: Option<StackCursor>,
    mutable: bool,
    /// Fields borrowed for reading / writing in the current result.
    reads: Cell<u64>,
    writes: Cell<u64>,
    /// Cache slot to sync when the iterator moves on.
    pending: Option<u32>,
    skipped: bool,
    changed: bool,
}

impl<'w> QueryIter<'w> {
    pub(crate) fn new(world: &'w World, query: &'w Query, mutable: bool) -> Self {
        let cursor = world.stack().get_cursor();
        Self {
            ctx: RunContext::new(world, query),
            cursor: Some(cursor),
            mutable,
            reads: Cell::new(0),
            writes: Cell::new(0),
            pending: None,
            skipped: false,
            changed: true,
        }
    }

    fn cache(&self) -> Option<&'w std::cell::RefCell<QueryCache>> {
        let world = self.ctx.world;
        self.ctx.query.cache.and_then(|id| world.query_cache(id))
    }

    fn sync_pending(&mut self) {
        let Some(slot) = self.pending.take() else {
            return;
        };
        if self.skipped {
            return;
        }
        if let Some(cache) = self.cache() {
            cache.borrow_mut().sync(self.ctx.world, slot);
        }
    }

    /// Advance to the next result.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        self.sync_pending();
        self.reads.set(0);
        self.writes.set(0);
        self.skipped = false;
        self.changed = true;

        if !self.ctx.next() {
            return false;
        }
        if self.ctx.query.flags.contains(QueryFlags::DETECT_CHANGES) {
            if let (Some(slot), Some(cache)) = (self.ctx.slot, self.cache()) {
                self.changed = cache.borrow().slot_changed(self.ctx.world, slot);
                self.pending = Some(slot);
            }
        }
        true
    }

    /// Number of `$this` rows in the current result. 0 for queries that
    /// only match fixed sources.
    #[must_use]
    pub fn count(&self) -> usize {
        if self.ctx.query.flags.contains(QueryFlags::HAS_THIS) {
            self.ctx.vars[0].count as usize
        } else {
            0
        }
    }

    /// Table of the current result.
    #[must_use]
    pub fn table(&self) -> Option<&'w Table> {
        let world = self.ctx.world;
        self.ctx.vars[0].table.and_then(|t| world.table(t))
    }

    /// The `$this` entities of the current result.
    #[must_use]
    pub fn entities(&self) -> &'w [Entity] {
        let this = self.ctx.vars[0];
        let Some(table) = self.table() else {
            return &[];
        };
        let start = this.offset as usize;
        table
            .entities()
            .get(start..start + self.count())
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn world(&self) -> &'w World {
        self.ctx.world
    }

    /// Whether the field matched. Optional fields may not.
    #[must_use]
    pub fn is_set(&self, field: usize) -> bool {
        field < 64 && self.ctx.set_fields & (1 << field) != 0
    }

    /// Whether the field is on the iterated entities rather than a fixed
    /// source or an ancestor.
    #[must_use]
    pub fn is_self(&self, field: usize) -> bool {
        self.ctx.sources.get(field).is_some_and(Option::is_none)
    }

    /// The id that matched a field. For wildcard terms this is the concrete
    /// id found in the table.
    #[must_use]
    pub fn field_id(&self, field: usize) -> Option<Id> {
        self.ctx.ids.get(field).copied()
    }

    /// Entity the field was matched on, `None` for `$this`.
    #[must_use]
    pub fn field_src(&self, field: usize) -> Option<Entity> {
        self.ctx.sources.get(field).copied().flatten()
    }

    /// Value of a variable. `$this` has one only when it was set to a single
    /// entity.
    #[must_use]
    pub fn get_var(&self, var: usize) -> Option<Entity> {
        let written = var < 64 && self.ctx.written & (1 << var) != 0;
        if !written {
            return None;
        }
        self.ctx.vars.get(var).and_then(|value| value.entity)
    }

    #[must_use]
    pub fn get_var_by_name(&self, name: &str) -> Option<Entity> {
        self.get_var(self.ctx.query.find_var(name)?)
    }

    /// Constrain a variable before iterating. Setting `$this` (variable 0)
    /// restricts iteration to that entity.
    ///
    /// # Panics
    ///
    /// Panics if `var` is not a variable of the query.
    pub fn set_var(&mut self, var: usize, entity: Entity) -> EcsResult<()> {
        assert!(var < self.ctx.query.var_count(), "variable {var} out of range");
        if !self.ctx.world.is_alive(entity) {
            return Err(EcsError::NotAlive(entity));
        }
        if var == 0 {
            self.ctx.set_this_entity(entity);
        } else {
            self.ctx.set_entity_var(var as u8, entity);
        }
        Ok(())
    }

    /// Restrict a cached query with `group_by` to one group.
    pub fn set_group(&mut self, group: u64) {
        self.ctx.group = Some(group);
    }

    /// Whether the tracked fields of the current result changed since the
    /// last iteration that did not skip it.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.changed
    }

    /// Leave the current result out of change tracking, so it still reports
    /// as changed next time.
    pub fn skip(&mut self) {
        self.skipped = true;
    }

    fn borrow_field(&self, field: usize, write: bool) {
        let mask = 1u64 << field;
        assert!(self.writes.get() & mask == 0, "field {field} is already borrowed mutably");
        if write {
            assert!(self.reads.get() & mask == 0, "field {field} is already borrowed");
            self.writes.set(self.writes.get() | mask);
        } else {
            self.reads.set(self.reads.get() | mask);
        }
    }

    fn locate<T: Component>(&self, field: usize) -> Option<Located<'w>> {
        if !self.is_set(field) {
            return None;
        }
        let world = self.ctx.world;
        let id = self.ctx.ids[field];
        let record = world.component_record(id)?;
        let info = record.type_info()?;
        assert!(
            info.is::<T>(),
            "field {field} is {}, not {}",
            info.name(),
            type_name::<T>()
        );
        let src = self.ctx.sources[field];

        if let Some(storage) = record.sparse() {
            return Some(Located::Sparse { storage, src });
        }
        let loc = self.ctx.locs[field];
        let table = world.table(loc.table?)?;
        let column = usize::from(loc.column?);
        let rows = match src {
            None => {
                let this = self.ctx.vars[0];
                (this.offset as usize, self.count())
            }
            Some(src) => (world.entity_record(src)?.row as usize, 1),
        };
        Some(Located::Column {
            table,
            column,
            rows,
            shared: src.is_some(),
        })
    }

    /// Read access to a field.
    ///
    /// Returns `None` for fields that did not match and for tags.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the field's component type or the field is
    /// borrowed mutably.
    #[must_use]
    pub fn field<T: Component>(&self, field: usize) -> Option<Field<'_, T>> {
        let located = self.locate::<T>(field)?;
        self.borrow_field(field, false);
        let len = self.count().max(1);
        let data = match located {
            Located::Sparse { storage, src: None } => FieldData::Sparse {
                storage,
                entities: self.entities(),
            },
            Located::Sparse { storage, src: Some(src) } => {
                // SAFETY: the storage holds values of T
                FieldData::Shared(unsafe { &*storage.get(src)?.cast::<T>() })
            }
            Located::Column {
                table,
                column,
                rows: (row, count),
                shared,
            } => {
                // SAFETY: the column holds values of T
                let values = unsafe { table.column(column).as_slice::<T>() };
                let values = values.get(row..row + count)?;
                if shared {
                    FieldData::Shared(values.first()?)
                } else {
                    FieldData::Slice(values)
                }
            }
        };
        Some(Field { data, len })
    }

    /// Write access to a field. Marks the field's column as changed.
    ///
    /// # Panics
    ///
    /// Panics if the iterator was created with [`Query::iter`], the field is
    /// declared read-only, `T` is not the field's component type, or the
    /// field is already borrowed.
    #[must_use]
    pub fn field_mut<T: Component>(&self, field: usize) -> Option<FieldMut<'_, T>> {
        assert!(self.mutable, "field_mut needs an iterator from Query::iter_mut");
        assert!(
            self.ctx.query.field_inout(field) != Some(InOut::In),
            "field {field} is read-only"
        );
        let located = self.locate::<T>(field)?;
        self.borrow_field(field, true);
        let len = self.count().max(1);
        let data = match located {
            Located::Sparse { storage, src: None } => FieldMutData::Sparse {
                storage,
                entities: self.entities(),
            },
            Located::Sparse { storage, src: Some(src) } => {
                // SAFETY: the world is borrowed mutably by the iterator and
                // the field is borrowed once
                FieldMutData::Shared(unsafe { &mut *storage.get(src)?.cast::<T>() })
            }
            Located::Column {
                table,
                column,
                rows: (row, count),
                shared,
            } => {
                let col = table.column(column);
                if row + count > col.len() {
                    return None;
                }
                table.mark_dirty(column);
                let values: &mut [T] = if count == 0 {
                    &mut []
                } else {
                    // SAFETY: rows are in bounds, the column holds values of
                    // T, and the world is borrowed mutably by the iterator
                    unsafe { std::slice::from_raw_parts_mut(col.as_ptr().cast::<T>().cast_mut().add(row), count) }
                };
                if shared {
                    FieldMutData::Shared(values.first_mut()?)
                } else {
                    FieldMutData::Slice(values)
                }
            }
        };
        Some(FieldMut { data, len })
    }
}

impl Drop for QueryIter<'_> {
    fn drop(&mut self) {
        self.sync_pending();
        if let Some(cursor) = self.cursor.take() {
            // SAFETY: the stack slices of the run context are not used after
            // this point
            unsafe { self.ctx.world.stack().restore_cursor(cursor) };
        }
    }
}

impl std::fmt::Debug for QueryIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryIter")
            .field("count", &self.count())
            .field("set_fields", &self.ctx.set_fields)
            .finish_non_exhaustive()
    }
}

enum Located<'w> {
    Sparse {
        storage: &'w SparseStorage,
        src: Option<Entity>,
    },
    Column {
        table: &'w Table,
        column: usize,
        rows: (usize, usize),
        shared: bool,
    },
}

enum FieldData<'a, T> {
    Slice(&'a [T]),
    /// One value seen by every row.
    Shared(&'a T),
    Sparse {
        storage: &'a SparseStorage,
        entities: &'a [Entity],
    },
}

/// Read-only view of one field of the current result.
///
/// Index `i` is the value for the `i`-th entity of
/// [`QueryIter::entities`]. A field matched on another entity (fixed source
/// or ancestor) has one value that every index returns.
pub struct Field<'a, T> {
    data: FieldData<'a, T>,
    len: usize,
}

impl<'a, T: 'static> Field<'a, T> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the field has a single value shared by all rows.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self.data, FieldData::Shared(_))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&'a T> {
        match self.data {
            FieldData::Slice(values) => values.get(index),
            FieldData::Shared(value) => (index < self.len).then_some(value),
            FieldData::Sparse { storage, entities } => {
                let ptr = storage.get(*entities.get(index)?)?;
                // SAFETY: the storage holds values of T
                Some(unsafe { &*ptr.cast::<T>() })
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    /// The values as a slice, for fields stored in table columns.
    #[must_use]
    pub const fn as_slice(&self) -> Option<&'a [T]> {
        match self.data {
            FieldData::Slice(values) => Some(values),
            _ => None,
        }
    }
}

impl<T: 'static> Index<usize> for Field<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("field index {index} out of bounds for {} rows", self.len),
        }
    }
}

enum FieldMutData<'a, T> {
    Slice(&'a mut [T]),
    Shared(&'a mut T),
    Sparse {
        storage: &'a SparseStorage,
        entities: &'a [Entity],
    },
}

/// Mutable view of one field of the current result.
pub struct FieldMut<'a, T> {
    data: FieldMutData<'a, T>,
    len: usize,
}

impl<T: 'static> FieldMut<'_, T> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self.data, FieldMutData::Shared(_))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        match &self.data {
            FieldMutData::Slice(values) => values.get(index),
            FieldMutData::Shared(value) => (index < self.len).then_some(&**value),
            FieldMutData::Sparse { storage, entities } => {
                let ptr = storage.get(*entities.get(index)?)?;
                // SAFETY: the storage holds values of T
                Some(unsafe { &*ptr.cast::<T>() })
            }
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match &mut self.data {
            FieldMutData::Slice(values) => values.get_mut(index),
            FieldMutData::Shared(value) => (index < self.len).then_some(&mut **value),
            FieldMutData::Sparse { storage, entities } => {
                let ptr = storage.get(*entities.get(index)?)?;
                // SAFETY: the storage holds values of T; `&mut self` keeps the
                // reference unique
                Some(unsafe { &mut *ptr.cast::<T>() })
            }
        }
    }

    /// Values in row order. A shared field yields its value once.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        let kind = match &mut self.data {
            FieldMutData::Slice(values) => IterMutKind::Slice(values.iter_mut()),
            FieldMutData::Shared(value) => IterMutKind::Shared(Some(&mut **value)),
            FieldMutData::Sparse { storage, entities } => IterMutKind::Sparse {
                storage,
                entities: entities.iter(),
            },
        };
        IterMut { kind }
    }
}

impl<T: 'static> Index<usize> for FieldMut<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("field index {index} out of bounds for {} rows", self.len),
        }
    }
}

impl<T: 'static> std::ops::IndexMut<usize> for FieldMut<'_, T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        let len = self.len;
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("field index {index} out of bounds for {len} rows"),
        }
    }
}

/// Iterator returned by [`FieldMut::iter_mut`].
pub struct IterMut<'b, T> {
    kind: IterMutKind<'b, T>,
}

enum IterMutKind<'b, T> {
    Slice(std::slice::IterMut<'b, T>),
    Shared(Option<&'b mut T>),
    Sparse {
        storage: &'b SparseStorage,
        entities: std::slice::Iter<'b, Entity>,
    },
}

impl<'b, T: 'static> Iterator for IterMut<'b, T> {
    type Item = &'b mut T;

    fn next(&mut self) -> Option<&'b mut T> {
        match &mut self.kind {
            IterMutKind::Slice(values) => values.next(),
            IterMutKind::Shared(value) => value.take(),
            IterMutKind::Sparse { storage, entities } => {
                let ptr = storage.get(*entities.next()?)?;
                // SAFETY: entities are distinct, so every value is yielded
                // once
                Some(unsafe { &mut *ptr.cast::<T>() })
            }
        }
    }
}
