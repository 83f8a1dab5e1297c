//! Backtracking evaluator for compiled query programs.
//!
//! Every op either produces a result and hands control to the next op, or
//! fails and sends control back to the previous op, which is asked for its
//! next result ("redo"). Running off the end of the program yields a result.
//! Ops remember the variable and field state they were entered with so a
//! redo starts from the same bindings.
//!
//! Scratch state lives on the world's stack allocator.

use loam_collections::StackSlice;

use crate::{
    World,
    entity::{Entity, EntityFlags},
    id::{ANY, Id, WILDCARD},
    query::{
        Query,
        cache::QueryCache,
        compiler::{CompiledTerm, Op, OpKind, QueryFlags, Ref},
        trav::{TravCache, UpMatch},
    },
    table::{TableFlags, TableId},
    table_cache::{CacheCursor, CacheIterKind},
};

/// Where the data of one field lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FieldLoc {
    /// Table holding the value: the iterated table for `$this` fields, the
    /// source's table otherwise.
    pub table: Option<TableId>,
    /// `None` for tags and sparse components.
    pub column: Option<u16>,
}

/// Field state captured for one result.
#[derive(Debug)]
pub(crate) struct MatchFields {
    pub ids: Box<[Id]>,
    /// `None` means the field is on `$this`.
    pub sources: Box<[Option<Entity>]>,
    pub locs: Box<[FieldLoc]>,
    pub set_fields: u64,
    pub up_fields: u64,
}

/// Value of a variable. `$this` binds a row range of a table, other
/// variables bind one entity.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct VarValue {
    pub table: Option<TableId>,
    pub entity: Option<Entity>,
    pub offset: u32,
    pub count: u32,
}

/// Per-op iteration state.
#[derive(Clone, Copy, Debug, Default)]
struct OpCtx {
    cursor: Option<CacheCursor>,
    table: Option<TableId>,
    /// Next type index to test, and how many more matches the table record
    /// allows.
    pos: u16,
    remaining: u16,
    /// Start values of `pos`/`remaining` for the current table.
    base: (u16, u16),
    row: u32,
    index: u32,
    slot: u32,
    phase: u8,
    init: bool,
    done: bool,
    entity: Option<Entity>,
    /// State on entry, restored on redo.
    written: u64,
    set_fields: u64,
    up_fields: u64,
}

/// Evaluation state of one query run.
pub(crate) struct RunContext<'w> {
    pub world: &'w World,
    pub query: &'w Query,
    pub vars: StackSlice<'w, VarValue>,
    ctx: StackSlice<'w, OpCtx>,
    pub ids: StackSlice<'w, Id>,
    pub sources: StackSlice<'w, Option<Entity>>,
    pub locs: StackSlice<'w, FieldLoc>,
    /// Variables bound so far.
    pub written: u64,
    pub set_fields: u64,
    pub up_fields: u64,
    trav: Vec<TravCache>,
    pub match_empty: bool,
    /// Restricts cache iteration to one group.
    pub group: Option<u64>,
    /// Cache slot of the current result.
    pub slot: Option<u32>,
    started: bool,
    finished: bool,
}

const fn bit(v: u8) -> u64 {
    1 << v
}

impl<'w> RunContext<'w> {
    pub(crate) fn new(world: &'w World, query: &'w Query) -> Self {
        let stack = world.stack();
        let fields = query.field_count().max(1);
        let mut ids = stack.alloc_slice(fields, Id::NULL);
        for (slot, id) in ids.iter_mut().zip(query.field_ids.iter()) {
            *slot = *id;
        }
        Self {
            world,
            query,
            vars: stack.alloc_slice(query.vars.len().max(1), VarValue::default()),
            ctx: stack.alloc_slice(query.ops.len().max(1), OpCtx::default()),
            ids,
            sources: stack.alloc_slice(fields, None),
            locs: stack.alloc_slice(fields, FieldLoc::default()),
            written: 0,
            set_fields: 0,
            up_fields: 0,
            trav: (0..query.ops.len()).map(|_| TravCache::new()).collect(),
            match_empty: query.flags.contains(QueryFlags::MATCH_EMPTY),
            group: None,
            slot: None,
            started: false,
            finished: false,
        }
    }

    pub(crate) const fn is_written(&self, var: u8) -> bool {
        self.written & bit(var) != 0
    }

    /// Bind `$this` to all rows of `table`.
    pub(crate) fn set_this(&mut self, table: TableId) {
        let count = self.world.table(table).map_or(0, |t| t.len() as u32);
        self.vars[0] = VarValue {
            table: Some(table),
            entity: None,
            offset: 0,
            count,
        };
        self.written |= 1;
    }

    /// Bind `$this` to the row of a single entity.
    pub(crate) fn set_this_entity(&mut self, entity: Entity) -> bool {
        let Some(record) = self.world.entity_record(entity) else {
            return false;
        };
        self.vars[0] = VarValue {
            table: Some(record.table),
            entity: Some(entity),
            offset: record.row,
            count: 1,
        };
        self.written |= 1;
        true
    }

    pub(crate) fn set_entity_var(&mut self, var: u8, entity: Entity) {
        self.vars[usize::from(var)] = VarValue {
            entity: Some(entity),
            ..VarValue::default()
        };
        self.written |= bit(var);
    }

    /// Produce the next result. Returns `false` once the program is
    /// exhausted.
    pub(crate) fn next(&mut self) -> bool {
        let n = self.query.ops.len();
        if n == 0 || self.finished {
            return false;
        }
        let (mut op, mut redo) = if self.started {
            (n - 1, true)
        } else {
            self.started = true;
            (0, false)
        };
        loop {
            if self.eval(op, redo) {
                if op + 1 == n {
                    return true;
                }
                op += 1;
                redo = false;
            } else {
                if op == 0 {
                    self.finished = true;
                    return false;
                }
                op -= 1;
                redo = true;
            }
        }
    }

    fn eval(&mut self, i: usize, redo: bool) -> bool {
        if redo {
            let c = self.ctx[i];
            self.written = c.written;
            self.set_fields = c.set_fields;
            self.up_fields = c.up_fields;
        } else {
            self.ctx[i] = OpCtx {
                written: self.written,
                set_fields: self.set_fields,
                up_fields: self.up_fields,
                ..OpCtx::default()
            };
        }

        let query = self.query;
        let op = query.ops[i];
        let term = query.terms.get(usize::from(op.term));
        match (op.kind, term) {
            (OpKind::Cache, _) => self.eval_cache(i, redo),
            (OpKind::Or, _) => self.eval_or(i, op, redo),
            (OpKind::And, Some(term)) => self.eval_term(i, term, redo),
            (OpKind::Not, Some(term)) => self.eval_not(i, term, redo),
            (OpKind::Optional, Some(term)) => self.eval_optional(i, term, redo),
            (OpKind::PredEq, Some(term)) => !redo && self.eval_pred(term, true),
            (OpKind::PredNeq, Some(term)) => !redo && self.eval_pred(term, false),
            (_, None) => false,
        }
    }

    fn restore(&mut self, i: usize) {
        let c = self.ctx[i];
        self.written = c.written;
        self.set_fields = c.set_fields;
        self.up_fields = c.up_fields;
    }

    /// The entity a term slot resolves to right now, if fixed or bound.
    fn bound_entity(&self, r: Ref) -> Option<Entity> {
        match r {
            Ref::Entity(e) => Some(e),
            Ref::Var(v) if self.is_written(v) => self.vars[usize::from(v)].entity,
            _ => None,
        }
    }

    /// The id of a term with bound variables substituted and unbound ones
    /// replaced by wildcards.
    fn pattern(&self, term: &CompiledTerm) -> Id {
        let index = |r: Ref| match r {
            Ref::Any => ANY.index(),
            Ref::Wildcard => WILDCARD.index(),
            _ => self.bound_entity(r).map_or(WILDCARD.index(), Entity::index),
        };
        match term.second {
            Some(second) => Id::pair_from_indices(index(term.first), index(second)),
            None => match term.first {
                Ref::Any => ANY.id(),
                Ref::Wildcard => WILDCARD.id(),
                r => self.bound_entity(r).map_or(WILDCARD.id(), Entity::id),
            },
        }
    }

    /// Table of a source and, for sources other than `$this`, the entity.
    fn src_table(&self, src: Ref) -> Option<(TableId, Option<Entity>)> {
        match src {
            Ref::Var(0) => {
                let this = self.vars[0];
                this.table.map(|table| (table, None))
            }
            Ref::Var(_) | Ref::Entity(_) => {
                let entity = self.bound_entity(src)?;
                let record = self.world.entity_record(entity)?;
                Some((record.table, Some(entity)))
            }
            Ref::Wildcard | Ref::Any => None,
        }
    }

    fn table_ok(&self, table: TableId) -> bool {
        let Some(t) = self.world.table(table) else {
            return false;
        };
        let flags = self.query.flags;
        if !self.match_empty && t.is_empty() {
            return false;
        }
        if t.flags().contains(TableFlags::IS_PREFAB) && !flags.contains(QueryFlags::MATCH_PREFAB) {
            return false;
        }
        !(t.flags().contains(TableFlags::IS_DISABLED) && !flags.contains(QueryFlags::MATCH_DISABLED))
    }

    /// Position the scan of op `i` at the entries of `table` that can match
    /// `pattern`.
    fn init_scan(&mut self, i: usize, table: TableId, pattern: Id) -> bool {
        let Some(tr) = self
            .world
            .component_record(pattern.any_to_wildcard())
            .and_then(|record| record.table_record(table))
        else {
            return false;
        };
        let remaining = if pattern.has_any() { 1 } else { tr.count };
        let c = &mut self.ctx[i];
        c.table = Some(table);
        c.pos = tr.index;
        c.remaining = remaining;
        c.base = (tr.index, remaining);
        true
    }

    /// Next type entry of the scanned table matching the term. Binds the
    /// variables of the id and sets the field.
    fn scan_next(&mut self, i: usize, term: &CompiledTerm, table: TableId, src: Option<Entity>) -> bool {
        let world = self.world;
        let Some(t) = world.table(table) else {
            return false;
        };
        let type_ = t.type_ids();
        let entry = self.written;
        let pattern = self.pattern(term);
        loop {
            self.written = entry;
            let c = &mut self.ctx[i];
            if c.remaining == 0 {
                return false;
            }
            let mut j = usize::from(c.pos);
            while j < type_.len() && !(pattern == ANY.id() || type_[j].matches(pattern)) {
                j += 1;
            }
            if j >= type_.len() {
                c.remaining = 0;
                return false;
            }
            c.pos = j as u16 + 1;
            c.remaining -= 1;

            let id = type_[j];
            if !self.bind_id_vars(term, id) {
                continue;
            }
            let f = usize::from(term.field);
            self.ids[f] = id;
            self.sources[f] = src;
            self.locs[f] = FieldLoc {
                table: Some(table),
                column: t.column_of_index(j).map(|c| c as u16),
            };
            self.set_fields |= 1 << f;
            self.up_fields &= !(1 << f);
            return true;
        }
    }

    /// Bind unbound variables in the id of `term` to the halves of `id`.
    /// Fails if a variable is bound to something else.
    fn bind_id_vars(&mut self, term: &CompiledTerm, id: Id) -> bool {
        let world = self.world;
        if let Ref::Var(v) = term.first {
            let value = if id.is_pair() {
                world.entity_at(id.first())
            } else {
                Some(Entity::from_bits(id.raw())).filter(|e| world.is_alive(*e))
            };
            if !self.bind(v, value) {
                return false;
            }
        }
        if let Some(Ref::Var(v)) = term.second {
            if !self.bind(v, world.entity_at(id.second())) {
                return false;
            }
        }
        true
    }

    fn bind(&mut self, var: u8, value: Option<Entity>) -> bool {
        let Some(value) = value else {
            return false;
        };
        if self.is_written(var) {
            return self.vars[usize::from(var)]
                .entity
                .is_some_and(|bound| bound.index() == value.index());
        }
        self.set_entity_var(var, value);
        true
    }

    fn set_up_field(&mut self, term: &CompiledTerm, id: Id, found: UpMatch) {
        let f = usize::from(term.field);
        self.ids[f] = id;
        self.sources[f] = Some(found.src);
        self.locs[f] = FieldLoc {
            table: Some(found.table),
            column: found.column.map(|c| c as u16),
        };
        self.set_fields |= 1 << f;
        self.up_fields |= 1 << f;
    }

    fn eval_term(&mut self, i: usize, term: &CompiledTerm, redo: bool) -> bool {
        if term.up {
            return self.eval_up(i, term, redo);
        }
        match term.src {
            Ref::Var(0) if !self.is_written(0) => self.select_this(i, term, !redo),
            Ref::Var(v) if !self.is_written(v) => self.select_var(i, term, v, redo),
            _ => self.check(i, term, redo),
        }
    }

    /// Match a term against a known source.
    fn check(&mut self, i: usize, term: &CompiledTerm, redo: bool) -> bool {
        let Some((table, src)) = self.src_table(term.src) else {
            return false;
        };
        if !redo {
            let pattern = self.pattern(term);
            if !self.init_scan(i, table, pattern) {
                return false;
            }
        }
        self.scan_next(i, term, table, src)
    }

    /// Find tables for an unbound `$this`. `first` starts the search.
    fn select_this(&mut self, i: usize, term: &CompiledTerm, first: bool) -> bool {
        let world = self.world;
        let pattern = self.pattern(term);
        let Some(record) = world.component_record(pattern.any_to_wildcard()) else {
            return false;
        };
        if first {
            let kind = if self.match_empty {
                CacheIterKind::All
            } else {
                CacheIterKind::Fill
            };
            let c = &mut self.ctx[i];
            c.cursor = Some(record.cache().cursor(kind));
            c.table = None;
        }
        let entry = self.ctx[i].written;
        loop {
            if let Some(table) = self.ctx[i].table {
                self.written = entry;
                self.set_this(table);
                if self.scan_next(i, term, table, None) {
                    return true;
                }
            }
            let Some(mut cursor) = self.ctx[i].cursor else {
                return false;
            };
            let next = loop {
                match record.cache().next(&mut cursor) {
                    None => break None,
                    Some((table, tr)) if self.table_ok(table) => break Some((table, *tr)),
                    Some(_) => {}
                }
            };
            let c = &mut self.ctx[i];
            c.cursor = Some(cursor);
            let Some((table, tr)) = next else {
                c.table = None;
                self.written = entry;
                return false;
            };
            c.table = Some(table);
            c.pos = tr.index;
            c.remaining = if pattern.has_any() { 1 } else { tr.count };
        }
    }

    /// Find entities for an unbound named variable source.
    fn select_var(&mut self, i: usize, term: &CompiledTerm, var: u8, redo: bool) -> bool {
        let world = self.world;
        let pattern = self.pattern(term);
        let Some(record) = world.component_record(pattern.any_to_wildcard()) else {
            return false;
        };
        if !redo {
            let c = &mut self.ctx[i];
            c.cursor = Some(record.cache().cursor(CacheIterKind::Fill));
            c.table = None;
            c.row = 0;
        }
        let entry = self.ctx[i].written;
        loop {
            if let Some(table) = self.ctx[i].table {
                let entities = world.table(table).map_or(&[][..], |t| t.entities());
                while let Some(&entity) = entities.get(self.ctx[i].row as usize) {
                    self.written = entry;
                    self.set_entity_var(var, entity);
                    if self.scan_next(i, term, table, Some(entity)) {
                        return true;
                    }
                    let c = &mut self.ctx[i];
                    c.row += 1;
                    (c.pos, c.remaining) = c.base;
                }
            }
            let Some(mut cursor) = self.ctx[i].cursor else {
                return false;
            };
            let next = record.cache().next(&mut cursor).map(|(table, tr)| (table, *tr));
            let c = &mut self.ctx[i];
            c.cursor = Some(cursor);
            let Some((table, tr)) = next else {
                self.written = entry;
                return false;
            };
            let remaining = if pattern.has_any() { 1 } else { tr.count };
            c.table = Some(table);
            c.row = 0;
            c.pos = tr.index;
            c.remaining = remaining;
            c.base = (tr.index, remaining);
        }
    }

    fn eval_up(&mut self, i: usize, term: &CompiledTerm, redo: bool) -> bool {
        let with = term.pattern();
        match term.src {
            Ref::Var(0) if !self.is_written(0) => self.select_up(i, term, with, redo),
            // up with an unbound entity variable source does not match
            Ref::Var(v) if !self.is_written(v) => false,
            _ => !redo && self.check_up(i, term, with),
        }
    }

    /// Match `with` on a known source: on the source itself if the term
    /// allows it, else on the nearest ancestor.
    fn check_up(&mut self, i: usize, term: &CompiledTerm, with: Id) -> bool {
        let Some((table, src)) = self.src_table(term.src) else {
            return false;
        };
        if term.self_ && self.init_scan(i, table, with) && self.scan_next(i, term, table, src) {
            return true;
        }
        let world = self.world;
        match self.trav[i].up(world, table, term.trav, with) {
            Some(found) => {
                self.set_up_field(term, with, found);
                true
            }
            None => false,
        }
    }

    /// Find tables for an unbound `$this` that see `with` on an ancestor.
    /// With `self`, tables owning `with` are yielded first.
    fn select_up(&mut self, i: usize, term: &CompiledTerm, with: Id, redo: bool) -> bool {
        let world = self.world;
        if !redo {
            let c = &mut self.ctx[i];
            c.phase = if term.self_ { 0 } else { 1 };
            c.init = false;
        }
        let entry = self.ctx[i].written;
        loop {
            if self.ctx[i].phase == 0 {
                let first = !self.ctx[i].init;
                self.ctx[i].init = true;
                if self.select_this(i, term, first) {
                    return true;
                }
                let c = &mut self.ctx[i];
                c.phase = 1;
                c.init = false;
                continue;
            }

            if !self.ctx[i].init {
                let Some(record) = world.component_record(with) else {
                    return false;
                };
                let c = &mut self.ctx[i];
                c.init = true;
                c.cursor = Some(record.cache().cursor(CacheIterKind::Fill));
                c.table = None;
                c.entity = None;
            }

            // tables below the current source
            if let Some(src) = self.ctx[i].entity {
                let index = self.ctx[i].index as usize;
                let mut trav = std::mem::take(&mut self.trav[i]);
                let next = trav
                    .down(world, term.trav, with, term.self_, src)
                    .iter()
                    .enumerate()
                    .skip(index)
                    .find(|(_, m)| self.table_ok(m.table))
                    .map(|(at, m)| (at, *m));
                self.trav[i] = trav;
                if let Some((at, m)) = next {
                    self.ctx[i].index = at as u32 + 1;
                    let Some(record) = world.entity_record(m.src) else {
                        continue;
                    };
                    let column = world.table(record.table).and_then(|t| t.column_of(with));
                    self.written = entry;
                    self.set_this(m.table);
                    self.set_up_field(
                        term,
                        with,
                        UpMatch {
                            src: m.src,
                            table: record.table,
                            column,
                        },
                    );
                    return true;
                }
                self.ctx[i].entity = None;
            }

            // next traversable entity that owns `with`
            let Some(record) = world.component_record(with) else {
                return false;
            };
            let found = loop {
                let c = self.ctx[i];
                if let Some(table) = c.table.and_then(|t| world.table(t)) {
                    let next = table.entities()[(c.row as usize).min(table.len())..]
                        .iter()
                        .position(|&e| {
                            world
                                .entity_record(e)
                                .is_some_and(|r| r.flags.contains(EntityFlags::TRAVERSABLE))
                        })
                        .map(|at| c.row as usize + at);
                    if let Some(row) = next {
                        self.ctx[i].row = row as u32 + 1;
                        break Some(table.entities()[row]);
                    }
                }
                let Some(mut cursor) = c.cursor else {
                    break None;
                };
                let next = loop {
                    match record.cache().next(&mut cursor) {
                        None => break None,
                        Some((table, _)) => {
                            if world
                                .table(table)
                                .is_some_and(|t| t.flags().contains(TableFlags::HAS_TRAVERSABLE))
                            {
                                break Some(table);
                            }
                        }
                    }
                };
                let c = &mut self.ctx[i];
                c.cursor = Some(cursor);
                match next {
                    Some(table) => {
                        c.table = Some(table);
                        c.row = 0;
                    }
                    None => break None,
                }
            };
            match found {
                Some(src) => {
                    let c = &mut self.ctx[i];
                    c.entity = Some(src);
                    c.index = 0;
                }
                None => {
                    self.written = entry;
                    return false;
                }
            }
        }
    }

    /// First match of a term against a bound source, without iterating
    /// alternatives.
    fn check_first(&mut self, i: usize, term: &CompiledTerm) -> bool {
        if term.up {
            let with = term.pattern();
            match term.src {
                Ref::Var(v) if !self.is_written(v) => false,
                _ => self.check_up(i, term, with),
            }
        } else {
            match term.src {
                Ref::Var(v) if !self.is_written(v) => false,
                _ => self.check(i, term, false),
            }
        }
    }

    fn eval_or(&mut self, i: usize, op: Op, redo: bool) -> bool {
        let query = self.query;
        let chain = &query.terms[usize::from(op.term)..usize::from(op.end)];
        let Some(head) = chain.first() else {
            return false;
        };

        if !matches!(head.src, Ref::Var(v) if !self.is_written(v)) {
            if redo {
                return false;
            }
            for term in chain {
                self.restore(i);
                if self.check_first(i, term) {
                    return true;
                }
            }
            return false;
        }

        if head.src != Ref::THIS {
            return false;
        }

        // select: each table is yielded by the first branch that matches it
        if !redo {
            let c = &mut self.ctx[i];
            c.phase = 0;
            c.init = false;
        }
        loop {
            let branch = usize::from(self.ctx[i].phase);
            let Some(term) = chain.get(branch) else {
                return false;
            };
            self.restore(i);
            let first = !self.ctx[i].init;
            self.ctx[i].init = true;
            if self.select_this(i, term, first) {
                let table = self.vars[0].table.and_then(|t| self.world.table(t));
                let earlier = table.is_some_and(|t| {
                    chain[..branch]
                        .iter()
                        .any(|prev| t.type_ids().iter().any(|id| id.matches(prev.pattern())))
                });
                if earlier {
                    continue;
                }
                return true;
            }
            let c = &mut self.ctx[i];
            c.phase += 1;
            c.init = false;
        }
    }

    fn eval_not(&mut self, i: usize, term: &CompiledTerm, redo: bool) -> bool {
        if redo {
            return false;
        }
        let matched = self.check_first(i, term);
        self.restore(i);
        !matched
    }

    fn eval_optional(&mut self, i: usize, term: &CompiledTerm, redo: bool) -> bool {
        if !redo {
            if self.eval_term(i, term, false) {
                return true;
            }
            // yield once with the field unset
            self.restore(i);
            let f = usize::from(term.field);
            self.set_fields &= !(1 << f);
            self.ids[f] = term.pattern();
            self.sources[f] = None;
            self.locs[f] = FieldLoc::default();
            self.ctx[i].done = true;
            return true;
        }
        if self.ctx[i].done {
            return false;
        }
        self.eval_term(i, term, true)
    }

    fn eval_pred(&mut self, term: &CompiledTerm, eq: bool) -> bool {
        let Some(var) = term.src.var() else {
            return false;
        };
        let Some(value) = term.second.and_then(|r| self.bound_entity(r)) else {
            return false;
        };
        if self.is_written(var) {
            let current = self.vars[usize::from(var)].entity;
            return (current == Some(value)) == eq;
        }
        if eq {
            self.set_entity_var(var, value);
            return true;
        }
        false
    }

    /// Yield the matches of the query cache.
    fn eval_cache(&mut self, i: usize, redo: bool) -> bool {
        let world = self.world;
        let Some(cell) = self.query.cache.and_then(|id| world.query_cache(id)) else {
            return false;
        };
        let fixed_this = (self.ctx[i].written & 1 != 0).then_some(self.vars[0]);

        let mut slot = {
            let cache = cell.borrow();
            match (redo, fixed_this) {
                (false, None) => cache.first_slot(self.group),
                (true, None) => cache.next_slot(self.ctx[i].slot, self.group),
                (_, Some(this)) => {
                    if redo {
                        self.ctx[i].index += 1;
                    }
                    let slots = this.table.map_or(&[][..], |t| cache.table_slots(t));
                    slots.get(self.ctx[i].index as usize).copied().unwrap_or(u32::MAX)
                }
            }
        };

        loop {
            if QueryCache::is_nil(slot) {
                self.slot = None;
                return false;
            }
            self.ctx[i].slot = slot;
            let table = cell.borrow().slot_table(slot);
            if fixed_this.is_none() && !self.table_ok(table) {
                slot = cell.borrow().next_slot(slot, self.group);
                continue;
            }

            cell.borrow_mut().refresh_up(world, slot);
            let (set, up) = {
                let cache = cell.borrow();
                cache.load(slot, &mut self.ids, &mut self.sources, &mut self.locs)
            };
            let c = self.ctx[i];
            self.set_fields = c.set_fields | set;
            self.up_fields = c.up_fields | up;
            match fixed_this {
                Some(this) => self.vars[0] = this,
                None => self.set_this(table),
            }
            self.slot = Some(slot);
            return true;
        }
    }

    /// Copy of the current field state.
    pub(crate) fn snapshot(&self) -> MatchFields {
        MatchFields {
            ids: self.ids.as_slice().into(),
            sources: self.sources.as_slice().into(),
            locs: self.locs.as_slice().into(),
            set_fields: self.set_fields,
            up_fields: self.up_fields,
        }
    }
}

/// Run the program of a cache query, over every table or over one table.
pub(crate) fn collect_matches(world: &World, query: &Query, table: Option<TableId>) -> Vec<(TableId, MatchFields)> {
    let stack = world.stack();
    let cursor = stack.get_cursor();
    let mut out = Vec::new();
    {
        let mut ctx = RunContext::new(world, query);
        ctx.match_empty = true;
        let run = match table {
            Some(table) => {
                let ok = ctx.table_ok(table);
                ctx.set_this(table);
                ok
            }
            None => true,
        };
        while run && ctx.next() {
            if let Some(table) = ctx.vars[0].table {
                out.push((table, ctx.snapshot()));
            }
        }
    }
    // SAFETY: the run context and its stack slices are gone
    unsafe { stack.restore_cursor(cursor) };
    out
}
