//! Runtime query builder.
//!
//! Queries are built by method chaining. Term modifiers (`src`, `up`,
//! `read`, ...) apply to the most recently added term.
//!
//! ```ignore
//! let query = world
//!     .query()
//!     .with::<Position>()
//!     .with::<Velocity>()
//!     .without::<Frozen>()
//!     .cache_kind(CacheKind::Auto)
//!     .build()?;
//!
//! let mut it = query.iter(&world);
//! while it.next() {
//!     let pos = it.field::<Position>(0).unwrap();
//!     for (entity, pos) in it.entities().iter().zip(pos.iter()) {
//!         println!("{entity} at ({}, {})", pos.x, pos.y);
//!     }
//! }
//! ```

use std::cmp::Ordering;

use crate::{
    World,
    component::Component,
    entity::Entity,
    error::EcsResult,
    id::{Id, PRED_EQ, PRED_NEQ},
    query::{
        Query,
        term::{InOut, Oper, Term, TermRef},
    },
    table::Table,
};

/// Whether and how much of a query is cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheKind {
    /// Same as [`CacheKind::None`]: ad-hoc queries are not cached unless
    /// asked to.
    #[default]
    Default,
    /// Cache the terms that can be cached, evaluate the rest per iteration.
    Auto,
    /// Cache everything; compilation fails if a term cannot be cached.
    All,
    None,
}

/// Computes the group of a table. Receives the `id` passed to
/// [`QueryBuilder::group_by`].
pub type GroupByFn = fn(&World, &Table, Id) -> u64;

#[derive(Clone, Copy, Debug)]
pub struct GroupBy {
    pub id: Id,
    pub callback: GroupByFn,
    /// Iterate groups from the highest id down.
    pub descending: bool,
}

/// Compares two values of the `order_by` component.
///
/// # Safety
///
/// Both pointers must point to initialized values of the component type.
pub type OrderByFn = unsafe fn(*const u8, *const u8) -> Ordering;

unsafe fn compare_values<T: Ord>(a: *const u8, b: *const u8) -> Ordering {
    // SAFETY: the caller passes values of the component type `T`
    unsafe { (*a.cast::<T>()).cmp(&*b.cast::<T>()) }
}

/// Sorts the rows of every matched table, by a component or by entity.
/// Ties and entity ordering compare entity ids.
#[derive(Clone, Copy, Debug)]
pub struct OrderBy {
    /// `None` orders by entity.
    pub id: Option<Id>,
    pub(crate) compare: Option<OrderByFn>,
}

impl OrderBy {
    #[must_use]
    pub const fn entity() -> Self {
        Self {
            id: None,
            compare: None,
        }
    }
}

/// Everything needed to compile a query.
#[derive(Clone, Debug, Default)]
pub struct QueryDesc {
    pub terms: Vec<Term>,
    pub cache_kind: CacheKind,
    /// `None` uses the world default.
    pub match_empty_tables: Option<bool>,
    pub detect_changes: bool,
    pub group_by: Option<GroupBy>,
    pub order_by: Option<OrderBy>,
}

impl QueryDesc {
    #[must_use]
    pub fn new(terms: Vec<Term>) -> Self {
        Self {
            terms,
            ..Self::default()
        }
    }
}

/// Builder for constructing queries at runtime.
pub struct QueryBuilder<'w> {
    world: &'w mut World,
    desc: QueryDesc,
    /// The next term continues an or chain.
    or_pending: bool,
}

impl<'w> QueryBuilder<'w> {
    pub fn new(world: &'w mut World) -> Self {
        Self {
            world,
            desc: QueryDesc::default(),
            or_pending: false,
        }
    }

    /// Add a term as is.
    #[must_use]
    pub fn term(mut self, mut term: Term) -> Self {
        if std::mem::take(&mut self.or_pending) {
            term.oper = Oper::Or;
        }
        self.desc.terms.push(term);
        self
    }

    /// Entity must have component `T`.
    #[must_use]
    pub fn with<T: Component>(self) -> Self {
        let id = self.world.component::<T>();
        self.term(Term::new(id))
    }

    #[must_use]
    pub fn with_id(self, id: Id) -> Self {
        self.term(Term::from_id(id))
    }

    #[must_use]
    pub fn with_pair(self, rel: impl Into<TermRef>, tgt: impl Into<TermRef>) -> Self {
        self.term(Term::pair(rel, tgt))
    }

    /// Entity must have `T`, but the field is never accessed.
    #[must_use]
    pub fn filter<T: Component>(self) -> Self {
        self.with::<T>().inout(InOut::None)
    }

    /// Entity must not have component `T`.
    #[must_use]
    pub fn without<T: Component>(self) -> Self {
        let id = self.world.component::<T>();
        self.term(Term::new(id).oper(Oper::Not))
    }

    #[must_use]
    pub fn without_id(self, id: Id) -> Self {
        self.term(Term::from_id(id).oper(Oper::Not))
    }

    #[must_use]
    pub fn without_pair(self, rel: impl Into<TermRef>, tgt: impl Into<TermRef>) -> Self {
        self.term(Term::pair(rel, tgt).oper(Oper::Not))
    }

    /// Fetch `T` if present; the query matches either way.
    #[must_use]
    pub fn optional<T: Component>(self) -> Self {
        let id = self.world.component::<T>();
        self.term(Term::new(id).oper(Oper::Optional))
    }

    #[must_use]
    pub fn optional_id(self, id: Id) -> Self {
        self.term(Term::from_id(id).oper(Oper::Optional))
    }

    /// Join the last term and the next one into an or chain.
    #[must_use]
    pub fn or(mut self) -> Self {
        if let Some(term) = self.desc.terms.last_mut() {
            term.oper = Oper::Or;
            self.or_pending = true;
        }
        self
    }

    fn modify(mut self, f: impl FnOnce(&mut Term)) -> Self {
        debug_assert!(!self.desc.terms.is_empty(), "term modifier without a term");
        if let Some(term) = self.desc.terms.last_mut() {
            f(term);
        }
        self
    }

    /// Match the last term on a fixed entity instead of `$this`.
    #[must_use]
    pub fn src(self, entity: Entity) -> Self {
        self.modify(|term| term.src = TermRef::Entity(entity))
    }

    /// Match the last term on a variable.
    #[must_use]
    pub fn src_var(self, name: &str) -> Self {
        self.modify(|term| term.src = TermRef::var(name))
    }

    /// Replace the target of the last (pair) term with a variable.
    #[must_use]
    pub fn second_var(self, name: &str) -> Self {
        self.modify(|term| term.second = Some(TermRef::var(name)))
    }

    #[must_use]
    pub fn up(self, rel: Entity) -> Self {
        self.modify(|term| *term = term.clone().up(rel))
    }

    #[must_use]
    pub fn self_up(self, rel: Entity) -> Self {
        self.modify(|term| *term = term.clone().self_up(rel))
    }

    /// Match the last term up `rel` and iterate tables in hierarchy order.
    #[must_use]
    pub fn cascade(self, rel: Entity) -> Self {
        self.modify(|term| *term = term.clone().cascade(rel))
    }

    /// Deepest tables first for the last (cascade) term.
    #[must_use]
    pub fn desc(self) -> Self {
        self.modify(|term| *term = term.clone().desc())
    }

    #[must_use]
    pub fn self_only(self) -> Self {
        self.modify(|term| *term = term.clone().self_only())
    }

    #[must_use]
    pub fn inout(self, inout: InOut) -> Self {
        self.modify(|term| term.inout = inout)
    }

    #[must_use]
    pub fn read(self) -> Self {
        self.inout(InOut::In)
    }

    #[must_use]
    pub fn write(self) -> Self {
        self.inout(InOut::InOut)
    }

    /// `$var == entity`.
    #[must_use]
    pub fn pred_eq(self, var: &str, entity: Entity) -> Self {
        self.term(Term::pair(PRED_EQ, entity).src(TermRef::var(var)))
    }

    /// `$var != entity`.
    #[must_use]
    pub fn pred_neq(self, var: &str, entity: Entity) -> Self {
        self.term(Term::pair(PRED_NEQ, entity).src(TermRef::var(var)))
    }

    /// `$var == $other`.
    #[must_use]
    pub fn pred_eq_var(self, var: &str, other: &str) -> Self {
        self.term(Term::pair(PRED_EQ, TermRef::var(other)).src(TermRef::var(var)))
    }

    #[must_use]
    pub const fn cache_kind(mut self, kind: CacheKind) -> Self {
        self.desc.cache_kind = kind;
        self
    }

    #[must_use]
    pub const fn match_empty_tables(mut self, match_empty: bool) -> Self {
        self.desc.match_empty_tables = Some(match_empty);
        self
    }

    #[must_use]
    pub const fn detect_changes(mut self) -> Self {
        self.desc.detect_changes = true;
        self
    }

    /// Group matched tables by the target of their first `(rel, *)` pair.
    #[must_use]
    pub fn group_by(self, rel: Entity) -> Self {
        self.group_by_fn(rel.id(), crate::query::cache::group_by_target)
    }

    #[must_use]
    pub const fn group_by_fn(mut self, id: Id, callback: GroupByFn) -> Self {
        self.desc.group_by = Some(GroupBy {
            id,
            callback,
            descending: false,
        });
        self
    }

    /// Sort the rows of matched tables by `T`, which must also be queried
    /// on `$this`. Tables are sorted before mutable iteration and by
    /// [`Query::sort`](crate::Query::sort).
    #[must_use]
    pub fn order_by<T: Component + Ord>(mut self) -> Self {
        let id = self.world.component::<T>().id();
        self.desc.order_by = Some(OrderBy {
            id: Some(id),
            compare: Some(compare_values::<T>),
        });
        self
    }

    /// Sort the rows of matched tables by entity id.
    #[must_use]
    pub const fn order_by_entity(mut self) -> Self {
        self.desc.order_by = Some(OrderBy::entity());
        self
    }

    /// The descriptor built so far.
    #[must_use]
    pub fn into_desc(self) -> QueryDesc {
        self.desc
    }

    /// Compile the query and, if it is cached, register its cache.
    pub fn build(self) -> EcsResult<Query> {
        self.world.create_query(self.desc)
    }
}

impl std::fmt::Debug for QueryBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder").field("desc", &self.desc).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{id::CHILD_OF, query::term::TravFlags};

    #[derive(Default)]
    struct Position;
    #[derive(Default)]
    struct Velocity;

    #[test]
    fn test_or_marks_both_terms() {
        let mut world = World::new();
        let desc = world
            .query()
            .with::<Position>()
            .or()
            .with::<Velocity>()
            .with_pair(CHILD_OF, TermRef::Wildcard)
            .into_desc();
        let opers: Vec<_> = desc.terms.iter().map(|t| t.oper).collect();
        assert_eq!(opers, vec![Oper::Or, Oper::Or, Oper::And]);
    }

    #[test]
    fn test_modifiers_apply_to_last_term() {
        let mut world = World::new();
        let parent = world.new_entity();
        let desc = world
            .query()
            .with::<Position>()
            .with::<Velocity>()
            .src(parent)
            .read()
            .into_desc();
        assert_eq!(desc.terms[0].src, TermRef::This);
        assert_eq!(desc.terms[1].src, TermRef::Entity(parent));
        assert_eq!(desc.terms[1].inout, InOut::In);
    }

    #[test]
    fn test_second_var_builds_pair_with_variable() {
        let mut world = World::new();
        let desc = world
            .query()
            .with_pair(CHILD_OF, TermRef::Wildcard)
            .second_var("parent")
            .into_desc();
        assert_eq!(desc.terms[0].second, Some(TermRef::var("parent")));
    }

    #[test]
    fn test_cascade_desc_and_order_by() {
        let mut world = World::new();
        let desc = world
            .query()
            .with::<Position>()
            .optional::<Velocity>()
            .cascade(CHILD_OF)
            .desc()
            .order_by_entity()
            .into_desc();
        assert_eq!(desc.terms[1].trav, Some(CHILD_OF));
        assert!(desc.terms[1].flags.contains(TravFlags::UP | TravFlags::CASCADE | TravFlags::DESC));
        assert!(!desc.terms[0].flags.contains(TravFlags::CASCADE));
        let order_by = desc.order_by.unwrap();
        assert_eq!(order_by.id, None);
        assert!(order_by.compare.is_none());
    }
}
