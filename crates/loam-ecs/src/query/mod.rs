//! Queries: find entities and tables by the ids they have.
//!
//! A query is a list of [`Term`]s compiled into a small program. Terms can
//! match on `$this` (the iterated table), on fixed entities or on named
//! variables, follow relationships up the hierarchy, and combine with and,
//! or, not and optional. Cached queries keep their matching tables up to
//! date as tables are created and deleted.
//!
//! # Example
//!
//! ```ignore
//! let query = world.query().with::<Position>().with::<Velocity>().build()?;
//! let mut it = query.iter(&world);
//! while it.next() {
//!     let vel = it.field::<Velocity>(1).unwrap();
//!     // ...
//! }
//! ```

pub mod builder;
pub mod cache;
pub(crate) mod compiler;
pub(crate) mod engine;
pub mod iter;
pub mod term;
pub mod trav;

pub use builder::{CacheKind, GroupBy, GroupByFn, OrderBy, OrderByFn, QueryBuilder, QueryDesc};
pub use cache::{QueryCache, group_by_cascade, group_by_target};
pub use compiler::{MAX_FIELDS, QueryFlags};
pub use iter::{Field, FieldMut, QueryIter};
pub use term::{InOut, Oper, Term, TermRef, TravFlags};

use crate::{
    World,
    entity::Entity,
    id::Id,
    query::compiler::{CompiledTerm, Op},
    table::TableId,
};

/// Handle of a registered query cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) u32);

impl QueryId {
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// A compiled query.
///
/// Uncached queries are self-contained. Cached queries refer to a cache
/// owned by the world that created them and must be iterated with that
/// world.
#[derive(Debug)]
pub struct Query {
    pub(crate) terms: Box<[CompiledTerm]>,
    pub(crate) ops: Box<[Op]>,
    /// Variable names; index 0 is `this`.
    pub(crate) vars: Box<[Box<str>]>,
    pub(crate) field_ids: Box<[Id]>,
    pub(crate) field_inout: Box<[InOut]>,
    pub(crate) field_src: Box<[Option<Entity>]>,
    pub(crate) flags: QueryFlags,
    pub(crate) cache: Option<QueryId>,
    pub(crate) group_by: Option<GroupBy>,
    pub(crate) order_by: Option<OrderBy>,
}

impl Query {
    /// Iterate with read-only field access.
    #[must_use]
    pub fn iter<'w>(&'w self, world: &'w World) -> QueryIter<'w> {
        QueryIter::new(world, self, false)
    }

    /// Iterate with mutable field access. Queries with `order_by` sort
    /// their tables first.
    #[must_use]
    pub fn iter_mut<'w>(&'w self, world: &'w mut World) -> QueryIter<'w> {
        self.sort(world);
        QueryIter::new(world, self, true)
    }

    /// Sort the rows of matched tables that changed since they were last
    /// sorted. Does nothing without `order_by`. Returns the number of tables
    /// whose rows moved.
    pub fn sort(&self, world: &mut World) -> usize {
        if self.order_by.is_none() {
            return 0;
        }
        self.cache.map_or(0, |id| world.sort_cached_tables(id))
    }

    /// Number of matched entities. Queries without `$this` count results.
    #[must_use]
    pub fn count(&self, world: &World) -> usize {
        let has_this = self.flags.contains(QueryFlags::HAS_THIS);
        let mut it = self.iter(world);
        let mut count = 0;
        while it.next() {
            count += if has_this { it.count() } else { 1 };
        }
        count
    }

    /// Whether the query matches anything.
    #[must_use]
    pub fn is_true(&self, world: &World) -> bool {
        let has_this = self.flags.contains(QueryFlags::HAS_THIS);
        let mut it = self.iter(world);
        while it.next() {
            if !has_this || it.count() > 0 {
                return true;
            }
        }
        false
    }

    /// Whether tracked fields of any match changed since the last iteration
    /// that visited it. Always true for queries without change detection.
    #[must_use]
    pub fn changed(&self, world: &World) -> bool {
        if !self.flags.contains(QueryFlags::DETECT_CHANGES) {
            return true;
        }
        self.cache
            .and_then(|id| world.query_cache(id))
            .is_none_or(|cache| cache.borrow().changed(world))
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.field_ids.len()
    }

    /// Id of a field as written in the query, with variables as wildcards.
    #[must_use]
    pub fn field_id(&self, field: usize) -> Option<Id> {
        self.field_ids.get(field).copied()
    }

    #[must_use]
    pub fn field_inout(&self, field: usize) -> Option<InOut> {
        self.field_inout.get(field).copied()
    }

    /// Fixed source of a field, `None` for `$this` and variables.
    #[must_use]
    pub fn field_src(&self, field: usize) -> Option<Entity> {
        self.field_src.get(field).copied().flatten()
    }

    /// Number of variables, including `$this`.
    #[must_use]
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn find_var(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|var| &**var == name)
    }

    #[must_use]
    pub fn var_name(&self, var: usize) -> Option<&str> {
        self.vars.get(var).map(|name| &**name)
    }

    #[must_use]
    pub const fn flags(&self) -> QueryFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Cached with one match per table and no per-iteration work.
    #[must_use]
    pub const fn is_trivial(&self) -> bool {
        self.flags.contains(QueryFlags::TRIVIAL)
    }

    #[must_use]
    pub const fn cache_id(&self) -> Option<QueryId> {
        self.cache
    }

    /// Tables in the query cache, empty ones included, in iteration order.
    #[must_use]
    pub fn cached_tables(&self, world: &World) -> Vec<TableId> {
        self.cache
            .and_then(|id| world.query_cache(id))
            .map(|cache| cache.borrow().tables())
            .unwrap_or_default()
    }
}
