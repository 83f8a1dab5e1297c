//! Turns a [`QueryDesc`] into a program for the query engine.
//!
//! Compilation resolves variables, validates terms, picks the traversal for
//! each term, orders terms so that positive terms bind variables before
//! optional, negated and predicate terms read them, and splits off the part
//! of the query that can be cached.

use bitflags::bitflags;
use tracing::trace;

use crate::{
    World,
    entity::Entity,
    error::QueryError,
    id::{ANY, CHILD_OF, DISABLED, INHERITABLE, IS_A, Id, PRED_EQ, PREFAB, TRAVERSABLE, WILDCARD},
    query::{
        Query,
        builder::{CacheKind, GroupBy, QueryDesc},
        cache::group_by_cascade,
        term::{InOut, Oper, Term, TermRef, TravFlags},
    },
};

/// Maximum number of fields and of variables.
pub const MAX_FIELDS: usize = 64;

/// A resolved term slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Ref {
    Entity(Entity),
    /// Variable index; 0 is `$this`.
    Var(u8),
    Wildcard,
    Any,
}

impl Ref {
    pub(crate) const THIS: Self = Self::Var(0);

    pub(crate) const fn var(self) -> Option<u8> {
        match self {
            Self::Var(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CompiledTerm {
    pub first: Ref,
    pub second: Option<Ref>,
    pub src: Ref,
    pub oper: Oper,
    pub inout: InOut,
    /// Relationship for `up`.
    pub trav: Entity,
    pub self_: bool,
    pub up: bool,
    pub field: u8,
    /// Position in the descriptor.
    pub index: usize,
}

impl CompiledTerm {
    /// The id with variables replaced by wildcards.
    pub(crate) fn pattern(&self) -> Id {
        let index = |r: Ref| match r {
            Ref::Entity(e) => e.index(),
            Ref::Var(_) | Ref::Wildcard => WILDCARD.index(),
            Ref::Any => ANY.index(),
        };
        match self.second {
            Some(second) => Id::pair_from_indices(index(self.first), index(second)),
            None => match self.first {
                Ref::Entity(e) => e.id(),
                Ref::Var(_) | Ref::Wildcard => WILDCARD.id(),
                Ref::Any => ANY.id(),
            },
        }
    }

    pub(crate) fn is_predicate(&self) -> bool {
        matches!(self.first, Ref::Entity(e) if e.index() == PRED_EQ.index()
            || e.index() == crate::id::PRED_NEQ.index())
    }

    const fn is_positive(&self) -> bool {
        matches!(self.oper, Oper::And | Oper::Or)
    }

    fn uses_var_in_id(&self) -> bool {
        matches!(self.first, Ref::Var(_)) || matches!(self.second, Some(Ref::Var(_)))
    }

    fn cacheable(&self) -> bool {
        self.src == Ref::THIS && !self.uses_var_in_id() && !self.is_predicate()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    And,
    Or,
    Not,
    Optional,
    PredEq,
    PredNeq,
    /// Yield matches from the query cache.
    Cache,
}

/// One instruction. Or chains cover `term..end`; every other op has
/// `end == term + 1`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Op {
    pub kind: OpKind,
    pub term: u16,
    pub end: u16,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        /// Some term matches on `$this`.
        const HAS_THIS = 1 << 0;
        /// Some term traverses up.
        const HAS_UP = 1 << 1;
        const CACHED = 1 << 2;
        /// Fully cached with one match per table and no field mapping.
        const TRIVIAL = 1 << 3;
        const MATCH_PREFAB = 1 << 4;
        const MATCH_DISABLED = 1 << 5;
        const MATCH_EMPTY = 1 << 6;
        const DETECT_CHANGES = 1 << 7;
        /// The query is the cached part of another query.
        const IS_CACHE = 1 << 8;
    }
}

/// Output of [`compile`]: the query and, for cached queries, the program
/// that populates its cache.
pub(crate) struct Compiled {
    pub query: Query,
    pub cache: Option<Query>,
}

struct Vars {
    names: Vec<Box<str>>,
}

impl Vars {
    fn resolve(&mut self, r: &TermRef) -> Result<Ref, QueryError> {
        Ok(match r {
            TermRef::This => Ref::THIS,
            TermRef::Entity(e) => Ref::Entity(*e),
            TermRef::Wildcard => Ref::Wildcard,
            TermRef::Any => Ref::Any,
            TermRef::Var(name) => {
                let index = match self.names.iter().position(|n| n == name) {
                    Some(index) => index,
                    None => {
                        self.names.push(name.clone());
                        self.names.len() - 1
                    }
                };
                if index >= MAX_FIELDS {
                    return Err(QueryError::TooManyVariables(index + 1));
                }
                Ref::Var(index as u8)
            }
        })
    }
}

fn resolve_traversal(world: &World, i: usize, term: &Term) -> Result<(bool, bool, Entity), QueryError> {
    if term.flags.contains(TravFlags::UP) {
        let rel = term.trav.unwrap_or(CHILD_OF);
        if !world.has_trait(rel, TRAVERSABLE) {
            return Err(QueryError::NotTraversable(i));
        }
        if term.fixed_id().is_none_or(Id::is_wildcard) {
            return Err(QueryError::WildcardTraversal(i));
        }
        return Ok((term.flags.contains(TravFlags::SELF), true, rel));
    }
    if term.flags.is_empty() && term.oper != Oper::Or && !term.is_predicate() {
        let inheritable = match &term.first {
            TermRef::Entity(e) => term.second.as_ref().is_none_or(|s| !s.is_var() && !s.is_pattern())
                && world.has_trait(*e, INHERITABLE),
            _ => false,
        };
        if inheritable {
            return Ok((true, true, IS_A));
        }
    }
    Ok((true, false, IS_A))
}

fn validate(world: &World, i: usize, term: &Term) -> Result<(), QueryError> {
    if let TermRef::Entity(e) = &term.first {
        if e.index() == 0 {
            return Err(QueryError::InvalidTermId(i));
        }
    }
    if let Some(TermRef::Entity(e)) = &term.second {
        if e.index() == 0 {
            return Err(QueryError::InvalidTermId(i));
        }
    }
    match &term.src {
        TermRef::Wildcard | TermRef::Any => return Err(QueryError::WildcardSource(i)),
        TermRef::Entity(e) if !world.is_alive(*e) => return Err(QueryError::InvalidTermId(i)),
        _ => {}
    }
    if term.is_predicate() {
        let src_ok = matches!(term.src, TermRef::Var(_));
        let second_ok = matches!(term.second, Some(TermRef::Entity(_) | TermRef::Var(_)));
        if !src_ok || !second_ok || term.oper != Oper::And {
            return Err(QueryError::InvalidPredicate(i));
        }
    }
    Ok(())
}

/// Program order: fixed-source positive terms, then other positive terms,
/// then optional, not and predicate terms. Stable, so or chains stay
/// contiguous.
fn rank(term: &CompiledTerm) -> u8 {
    if term.is_predicate() {
        4
    } else {
        match term.oper {
            Oper::And | Oper::Or => u8::from(!matches!(term.src, Ref::Entity(_))),
            Oper::Optional => 2,
            Oper::Not => 3,
        }
    }
}

fn build_ops(terms: &[CompiledTerm]) -> Vec<Op> {
    let mut ops = Vec::with_capacity(terms.len());
    let mut i = 0;
    while i < terms.len() {
        let term = &terms[i];
        let mut end = i + 1;
        let kind = if term.is_predicate() {
            match term.first {
                Ref::Entity(e) if e.index() == PRED_EQ.index() => OpKind::PredEq,
                _ => OpKind::PredNeq,
            }
        } else {
            match term.oper {
                Oper::And => OpKind::And,
                Oper::Not => OpKind::Not,
                Oper::Optional => OpKind::Optional,
                Oper::Or => {
                    while end < terms.len() && terms[end].oper == Oper::Or && terms[end].field == term.field {
                        end += 1;
                    }
                    OpKind::Or
                }
            }
        };
        ops.push(Op {
            kind,
            term: i as u16,
            end: end as u16,
        });
        i = end;
    }
    ops
}

/// Compile `desc`.
pub(crate) fn compile(world: &World, desc: &QueryDesc) -> Result<Compiled, QueryError> {
    if desc.terms.is_empty() {
        return Err(QueryError::NoTerms);
    }

    let mut vars = Vars {
        names: vec!["this".into()],
    };
    let mut terms = Vec::with_capacity(desc.terms.len());
    let mut field_count = 0usize;
    let mut prev_or: Option<Ref> = None;
    let mut cascade: Option<GroupBy> = None;

    for (i, term) in desc.terms.iter().enumerate() {
        validate(world, i, term)?;
        let (self_, up, trav) = resolve_traversal(world, i, term)?;

        if term.flags.contains(TravFlags::DESC) && !term.flags.contains(TravFlags::CASCADE) {
            return Err(QueryError::InvalidCascade(i));
        }
        if term.flags.contains(TravFlags::CASCADE) {
            if cascade.is_some() || desc.group_by.is_some() || term.src != TermRef::This {
                return Err(QueryError::InvalidCascade(i));
            }
            cascade = Some(GroupBy {
                id: trav.id(),
                callback: group_by_cascade,
                descending: term.flags.contains(TravFlags::DESC),
            });
        }

        let src = vars.resolve(&term.src)?;
        let first = vars.resolve(&term.first)?;
        let second = term.second.as_ref().map(|s| vars.resolve(s)).transpose()?;

        let continues_chain = term.oper == Oper::Or && prev_or.is_some();
        if term.oper == Oper::Or {
            if up {
                return Err(QueryError::InvalidOr(i));
            }
            if prev_or.is_some_and(|prev| prev != src) {
                return Err(QueryError::InvalidOr(i));
            }
            prev_or = Some(src);
        } else {
            prev_or = None;
        }

        if !continues_chain {
            field_count += 1;
        }
        terms.push(CompiledTerm {
            first,
            second,
            src,
            oper: term.oper,
            inout: term.inout,
            trav,
            self_,
            up,
            field: (field_count - 1).min(MAX_FIELDS) as u8,
            index: i,
        });
    }

    if field_count > MAX_FIELDS {
        return Err(QueryError::TooManyFields(field_count));
    }

    let uses_this = terms.iter().any(|t| {
        t.src == Ref::THIS || t.first == Ref::THIS || t.second == Some(Ref::THIS)
    });
    let binds_this = terms
        .iter()
        .any(|t| t.src == Ref::THIS && t.is_positive() && !t.is_predicate());
    if uses_this && !binds_this {
        return Err(QueryError::UnboundThis);
    }

    for t in terms.iter().filter(|t| t.is_predicate()) {
        let known = |var: u8| {
            terms
                .iter()
                .filter(|o| !o.is_predicate())
                .any(|o| o.src == Ref::Var(var) || o.first == Ref::Var(var) || o.second == Some(Ref::Var(var)))
        };
        for slot in [Some(t.src), t.second].into_iter().flatten() {
            if let Some(var) = slot.var() {
                if var == 0 {
                    return Err(QueryError::InvalidPredicate(t.index));
                }
                if !known(var) {
                    return Err(QueryError::UnknownVariable(vars.names[usize::from(var)].to_string()));
                }
            }
        }
    }

    terms.sort_by_key(rank);

    let mut field_ids = vec![Id::NULL; field_count];
    let mut field_inout = vec![InOut::Default; field_count];
    let mut field_src = vec![None; field_count];
    for t in &terms {
        let f = usize::from(t.field);
        if field_ids[f].is_null() {
            field_ids[f] = t.pattern();
            field_inout[f] = t.inout;
            if let Ref::Entity(e) = t.src {
                field_src[f] = Some(e);
            }
        }
    }

    let mut flags = QueryFlags::empty();
    flags.set(QueryFlags::HAS_THIS, uses_this);
    flags.set(QueryFlags::HAS_UP, terms.iter().any(|t| t.up));
    flags.set(QueryFlags::DETECT_CHANGES, desc.detect_changes);
    flags.set(
        QueryFlags::MATCH_EMPTY,
        desc.match_empty_tables.unwrap_or(world.config().default_match_empty),
    );
    for t in terms.iter().filter(|t| t.oper != Oper::Not) {
        if t.pattern() == PREFAB.id() {
            flags |= QueryFlags::MATCH_PREFAB;
        }
        if t.pattern() == DISABLED.id() {
            flags |= QueryFlags::MATCH_DISABLED;
        }
    }

    let group_by = cascade.or(desc.group_by);
    let needs_cache = cascade.is_some() || desc.order_by.is_some();
    let caching = match desc.cache_kind {
        CacheKind::None if needs_cache => return Err(QueryError::CacheRequired),
        CacheKind::Default => needs_cache,
        CacheKind::None => false,
        CacheKind::Auto => true,
        CacheKind::All => {
            if let Some(t) = terms.iter().find(|t| !t.cacheable()) {
                return Err(QueryError::NotCacheable(t.index));
            }
            true
        }
    };

    let (cached, uncached): (Vec<_>, Vec<_>) = if caching {
        terms.into_iter().partition(CompiledTerm::cacheable)
    } else {
        (Vec::new(), terms)
    };
    let cache_binds_this = cached.iter().any(|t| t.is_positive());

    if let Some(id) = desc.order_by.and_then(|order_by| order_by.id) {
        let queried = cached
            .iter()
            .any(|t| t.oper == Oper::And && t.self_ && !t.up && t.pattern() == id);
        if !queried {
            return Err(QueryError::InvalidOrderBy(id));
        }
    }

    let make = |terms: Vec<CompiledTerm>, ops: Vec<Op>, flags: QueryFlags| Query {
        terms: terms.into_boxed_slice(),
        ops: ops.into_boxed_slice(),
        vars: vars.names.clone().into_boxed_slice(),
        field_ids: field_ids.clone().into_boxed_slice(),
        field_inout: field_inout.clone().into_boxed_slice(),
        field_src: field_src.clone().into_boxed_slice(),
        flags,
        cache: None,
        group_by,
        order_by: desc.order_by,
    };

    if !cache_binds_this {
        if desc.cache_kind == CacheKind::All || needs_cache {
            return Err(QueryError::UnboundThis);
        }
        let mut terms = cached;
        terms.extend(uncached);
        terms.sort_by_key(rank);
        let ops = build_ops(&terms);
        trace!(ops = ops.len(), "compiled uncached query");
        return Ok(Compiled {
            query: make(terms, ops, flags),
            cache: None,
        });
    }

    let trivial = uncached.is_empty()
        && !desc.detect_changes
        && group_by.is_none()
        && desc.order_by.is_none()
        && cached
            .iter()
            .all(|t| t.oper == Oper::And && !t.up && !t.pattern().is_wildcard());

    let mut cache_flags = flags | QueryFlags::IS_CACHE | QueryFlags::HAS_THIS | QueryFlags::MATCH_EMPTY;
    cache_flags.set(QueryFlags::HAS_UP, cached.iter().any(|t| t.up));
    cache_flags.set(QueryFlags::TRIVIAL, trivial);
    let cache_ops = build_ops(&cached);
    let cache = make(cached, cache_ops, cache_flags);

    let mut main_ops = vec![Op {
        kind: OpKind::Cache,
        term: 0,
        end: 0,
    }];
    main_ops.extend(build_ops(&uncached));
    let mut main_flags = flags | QueryFlags::CACHED;
    main_flags.set(QueryFlags::TRIVIAL, trivial);
    trace!(cached = cache.terms.len(), uncached = uncached.len(), trivial, "compiled cached query");

    Ok(Compiled {
        query: make(uncached, main_ops, main_flags),
        cache: Some(cache),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::term::Term;

    #[derive(Default)]
    struct Position;
    #[derive(Default)]
    struct Velocity;

    fn desc(terms: Vec<Term>) -> QueryDesc {
        QueryDesc::new(terms)
    }

    #[test]
    fn test_rejects_empty_query() {
        let world = World::new();
        assert_eq!(compile(&world, &desc(vec![])).err(), Some(QueryError::NoTerms));
    }

    #[test]
    fn test_rejects_wildcard_source() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let err = compile(&world, &desc(vec![Term::new(pos).src(TermRef::Wildcard)])).err();
        assert_eq!(err, Some(QueryError::WildcardSource(0)));
    }

    #[test]
    fn test_rejects_unbound_this() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let err = compile(&world, &desc(vec![Term::new(pos).oper(Oper::Not)])).err();
        assert_eq!(err, Some(QueryError::UnboundThis));
    }

    #[test]
    fn test_rejects_up_on_non_traversable() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let rel = world.new_entity();
        let err = compile(&world, &desc(vec![Term::new(pos).up(rel)])).err();
        assert_eq!(err, Some(QueryError::NotTraversable(0)));
    }

    #[test]
    fn test_rejects_predicate_on_this_or_unknown_var() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let e = world.new_entity();

        let on_this = Term::pair(PRED_EQ, e).src(TermRef::This);
        let err = compile(&world, &desc(vec![Term::new(pos), on_this])).err();
        assert_eq!(err, Some(QueryError::InvalidPredicate(1)));

        let unknown = Term::pair(PRED_EQ, e).src(TermRef::var("x"));
        let err = compile(&world, &desc(vec![Term::new(pos), unknown])).err();
        assert_eq!(err, Some(QueryError::UnknownVariable("x".into())));
    }

    #[test]
    fn test_rejects_or_chain_with_mixed_sources() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let vel = world.component::<Velocity>();
        let e = world.new_entity();
        let terms = vec![Term::new(pos).oper(Oper::Or), Term::new(vel).oper(Oper::Or).src(e)];
        assert_eq!(compile(&world, &desc(terms)).err(), Some(QueryError::InvalidOr(1)));
    }

    #[test]
    fn test_positive_terms_ordered_first() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let vel = world.component::<Velocity>();
        let terms = vec![Term::new(vel).oper(Oper::Not), Term::new(pos)];
        let compiled = compile(&world, &desc(terms)).unwrap();
        let kinds: Vec<_> = compiled.query.ops.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::And, OpKind::Not]);
        // fields keep descriptor numbering
        assert_eq!(compiled.query.terms[0].field, 1);
    }

    #[test]
    fn test_or_chain_shares_one_field() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let vel = world.component::<Velocity>();
        let terms = vec![Term::new(pos).oper(Oper::Or), Term::new(vel).oper(Oper::Or)];
        let compiled = compile(&world, &desc(terms)).unwrap();
        assert_eq!(compiled.query.field_count(), 1);
        assert_eq!(compiled.query.ops.len(), 1);
        assert_eq!(compiled.query.ops[0].kind, OpKind::Or);
    }

    #[test]
    fn test_inheritable_defaults_to_self_up_is_a() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        world.add_id(pos, INHERITABLE.id()).unwrap();
        let compiled = compile(&world, &desc(vec![Term::new(pos)])).unwrap();
        let term = &compiled.query.terms[0];
        assert!(term.self_ && term.up);
        assert_eq!(term.trav, IS_A);
    }

    #[test]
    fn test_cache_split_and_trivial() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let vel = world.component::<Velocity>();

        let mut d = desc(vec![Term::new(pos), Term::new(vel)]);
        d.cache_kind = CacheKind::Auto;
        let compiled = compile(&world, &d).unwrap();
        assert!(compiled.query.flags.contains(QueryFlags::CACHED | QueryFlags::TRIVIAL));
        assert_eq!(compiled.cache.map(|c| c.terms.len()), Some(2));

        let parent = world.new_entity();
        let mut d = desc(vec![Term::new(pos), Term::new(vel).src(parent)]);
        d.cache_kind = CacheKind::Auto;
        let compiled = compile(&world, &d).unwrap();
        assert!(!compiled.query.flags.contains(QueryFlags::TRIVIAL));
        assert_eq!(compiled.query.ops[0].kind, OpKind::Cache);
        assert_eq!(compiled.query.ops.len(), 2);

        d.cache_kind = CacheKind::All;
        assert_eq!(compile(&world, &d).err(), Some(QueryError::NotCacheable(1)));
    }

    #[test]
    fn test_cascade_groups_by_depth_and_forces_cache() {
        let mut world = World::new();
        let pos = world.component::<Position>();

        let d = desc(vec![Term::new(pos), Term::new(pos).oper(Oper::Optional).cascade(CHILD_OF).desc()]);
        let compiled = compile(&world, &d).unwrap();
        assert!(compiled.query.flags.contains(QueryFlags::CACHED));
        assert!(!compiled.query.flags.contains(QueryFlags::TRIVIAL));
        let group_by = compiled.query.group_by.unwrap();
        assert_eq!(group_by.id, CHILD_OF.id());
        assert!(group_by.descending);

        let mut d = desc(vec![Term::new(pos).cascade(CHILD_OF)]);
        d.cache_kind = CacheKind::None;
        assert_eq!(compile(&world, &d).err(), Some(QueryError::CacheRequired));
    }

    #[test]
    fn test_rejects_invalid_cascade() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let vel = world.component::<Velocity>();

        let two = desc(vec![Term::new(pos).cascade(CHILD_OF), Term::new(vel).cascade(CHILD_OF)]);
        assert_eq!(compile(&world, &two).err(), Some(QueryError::InvalidCascade(1)));

        let desc_only = desc(vec![Term::new(pos).desc()]);
        assert_eq!(compile(&world, &desc_only).err(), Some(QueryError::InvalidCascade(0)));

        let mut with_group = desc(vec![Term::new(pos).cascade(CHILD_OF)]);
        with_group.group_by = Some(GroupBy {
            id: CHILD_OF.id(),
            callback: crate::query::cache::group_by_target,
            descending: false,
        });
        assert_eq!(compile(&world, &with_group).err(), Some(QueryError::InvalidCascade(0)));
    }

    #[test]
    fn test_order_by_must_be_queried_on_this() {
        let mut world = World::new();
        let pos = world.component::<Position>();
        let vel = world.component::<Velocity>();
        let order_by = Some(crate::query::builder::OrderBy {
            id: Some(vel.id()),
            compare: None,
        });

        let mut d = desc(vec![Term::new(pos)]);
        d.order_by = order_by;
        assert_eq!(compile(&world, &d).err(), Some(QueryError::InvalidOrderBy(vel.id())));

        let mut d = desc(vec![Term::new(pos), Term::new(vel)]);
        d.order_by = order_by;
        let compiled = compile(&world, &d).unwrap();
        assert!(compiled.query.flags.contains(QueryFlags::CACHED));
        assert!(!compiled.query.flags.contains(QueryFlags::TRIVIAL));
    }
}
