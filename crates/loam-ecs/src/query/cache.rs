//! Incrementally maintained match lists for cached queries.
//!
//! A cache owns the compiled program for the cacheable terms of a query. It
//! runs that program once over every table when created, and again for each
//! table created afterwards, storing one match per result. Tables leaving
//! the world remove their matches. Matches are kept ordered by group id so a
//! group is one contiguous span of the list.
//!
//! Cascade queries group by hierarchy depth, so parents come before their
//! children. Queries with `order_by` additionally sort the rows of each
//! matched table in place; a table is only resorted after it changed.

use std::collections::BTreeMap;

use loam_collections::Map;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    World,
    entity::{Entity, EntityIndex},
    id::{Id, WILDCARD},
    query::{
        Query,
        builder::{GroupBy, OrderBy},
        compiler::QueryFlags,
        engine::{self, FieldLoc, MatchFields},
        term::{InOut, Oper},
        trav::relation_depth,
    },
    table::{Table, TableId},
};

const NIL: u32 = u32::MAX;

/// Default group-by callback: the target of the table's first `(rel, *)`
/// pair, or 0.
pub fn group_by_target(world: &World, table: &Table, rel: Id) -> u64 {
    let Some(rel) = rel.entity() else {
        return 0;
    };
    world
        .component_record(Id::pair(rel, WILDCARD))
        .and_then(|record| record.table_record(table.id()))
        .map_or(0, |tr| u64::from(table.type_ids()[usize::from(tr.index)].second()))
}

/// Cascade group-by callback: depth of the table in the `rel` hierarchy.
/// Root tables are at depth 0.
pub fn group_by_cascade(world: &World, table: &Table, rel: Id) -> u64 {
    rel.entity()
        .map_or(0, |rel| u64::from(relation_depth(world, table, rel)))
}

#[derive(Debug)]
enum MatchData {
    /// All fields are on the table itself; only columns are stored.
    Trivial {
        columns: Box<[Option<u16>]>,
        set_fields: u64,
    },
    Full(MatchFields),
}

#[derive(Debug)]
struct Match {
    table: TableId,
    prev: u32,
    next: u32,
    group: u64,
    data: MatchData,
    /// `(dirty counter index, last seen value)` for every tracked counter.
    monitor: Option<Box<[(u16, u32)]>>,
}

#[derive(Clone, Copy, Debug)]
struct GroupSpan {
    first: u32,
    last: u32,
    count: u32,
}

/// The cache of one query.
#[derive(Debug)]
pub struct QueryCache {
    query: Query,
    matches: Vec<Option<Match>>,
    free: Vec<u32>,
    first: u32,
    last: u32,
    /// Table id to the slots of its matches.
    tables: Map<SmallVec<[u32; 1]>>,
    /// Spans keyed by [`QueryCache::group_key`].
    groups: BTreeMap<u64, GroupSpan>,
    group_by: Option<GroupBy>,
    order_by: Option<OrderBy>,
    /// Table id to the `(entity set, order_by column)` dirty counters seen
    /// after the table was last sorted.
    sorted: Map<(u32, u32)>,
    /// Fields whose columns feed change detection.
    monitor_fields: u64,
    len: u32,
}

impl QueryCache {
    /// Create the cache for `query` (the cacheable part of a query) and
    /// match it against every existing table.
    pub(crate) fn new(world: &World, query: Query) -> Self {
        let monitor_fields = if query.flags.contains(QueryFlags::DETECT_CHANGES) {
            query
                .terms
                .iter()
                .filter(|t| t.oper != Oper::Not && !t.up && !matches!(t.inout, InOut::Out | InOut::None))
                .fold(0u64, |mask, t| mask | (1 << t.field))
        } else {
            0
        };
        let group_by = query.group_by;
        let order_by = query.order_by;

        let mut cache = Self {
            query,
            matches: Vec::new(),
            free: Vec::new(),
            first: NIL,
            last: NIL,
            tables: Map::new(),
            groups: BTreeMap::new(),
            group_by,
            order_by,
            sorted: Map::new(),
            monitor_fields,
            len: 0,
        };
        cache.populate(world);
        debug!(matches = cache.len, trivial = cache.is_trivial(), "created query cache");
        cache
    }

    fn populate(&mut self, world: &World) {
        for (table, fields) in engine::collect_matches(world, &self.query, None) {
            self.insert(world, table, fields);
        }
    }

    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.query.flags.contains(QueryFlags::TRIVIAL)
    }

    /// Whether some term resolves through up traversal.
    #[must_use]
    pub fn has_up(&self) -> bool {
        self.query.flags.contains(QueryFlags::HAS_UP)
    }

    /// Number of matches.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn contains_table(&self, table: TableId) -> bool {
        self.tables.contains(u64::from(table.as_raw()))
    }

    /// Matched tables in iteration order, one entry per match.
    #[must_use]
    pub fn tables(&self) -> Vec<TableId> {
        let mut out = Vec::with_capacity(self.len());
        let mut slot = self.first;
        while slot != NIL {
            let m = self.get(slot);
            out.push(m.table);
            slot = m.next;
        }
        out
    }

    /// Ids whose changes on a traversable entity require a rematch: the
    /// components of up terms and `(rel, *)` for their relationships.
    pub(crate) fn monitored_ids(&self) -> Vec<Id> {
        let mut ids = Vec::new();
        for t in self.query.terms.iter().filter(|t| t.up) {
            ids.push(t.pattern());
            ids.push(Id::pair(t.trav, WILDCARD));
        }
        ids
    }

    /// Position of a group in the span map. Descending groups are stored
    /// with inverted keys so the map order is the iteration order.
    fn group_key(&self, group: u64) -> u64 {
        if self.group_by.is_some_and(|g| g.descending) {
            !group
        } else {
            group
        }
    }

    fn get(&self, slot: u32) -> &Match {
        match &self.matches[slot as usize] {
            Some(m) => m,
            None => unreachable!("query cache slot {slot} is free"),
        }
    }

    fn get_mut(&mut self, slot: u32) -> &mut Match {
        match &mut self.matches[slot as usize] {
            Some(m) => m,
            None => unreachable!("query cache slot {slot} is free"),
        }
    }

    fn set_prev(&mut self, slot: u32, prev: u32) {
        if slot == NIL {
            self.last = prev;
        } else {
            self.get_mut(slot).prev = prev;
        }
    }

    fn set_next(&mut self, slot: u32, next: u32) {
        if slot == NIL {
            self.first = next;
        } else {
            self.get_mut(slot).next = next;
        }
    }

    fn insert(&mut self, world: &World, table: TableId, fields: MatchFields) {
        let Some(t) = world.table(table) else {
            return;
        };
        let group = self
            .group_by
            .map_or(0, |group_by| (group_by.callback)(world, t, group_by.id));

        let data = if self.is_trivial() {
            debug_assert!(!self.contains_table(table), "trivial cache matched table {table:?} twice");
            MatchData::Trivial {
                columns: fields.locs.iter().map(|loc| loc.column).collect(),
                set_fields: fields.set_fields,
            }
        } else {
            MatchData::Full(fields)
        };

        let monitor = (self.monitor_fields != 0).then(|| {
            let mut monitor = vec![(0u16, 0u32)];
            for field in 0..64 {
                if self.monitor_fields & (1 << field) == 0 {
                    continue;
                }
                if let Some(column) = column_of(&data, field).filter(|_| is_self(&data, field)) {
                    monitor.push((column + 1, 0));
                }
            }
            monitor.into_boxed_slice()
        });

        // insert at the end of the group's span, before the next group
        let key = self.group_key(group);
        let (prev, next) = match self.groups.get(&key) {
            Some(span) => (span.last, self.get(span.last).next),
            None => match self.groups.range(key..).next() {
                Some((_, span)) => (self.get(span.first).prev, span.first),
                None => (self.last, NIL),
            },
        };

        let node = Match {
            table,
            prev,
            next,
            group,
            data,
            monitor,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.matches[slot as usize] = Some(node);
                slot
            }
            None => {
                self.matches.push(Some(node));
                (self.matches.len() - 1) as u32
            }
        };
        self.set_next(prev, slot);
        self.set_prev(next, slot);

        let span = self.groups.entry(key).or_insert(GroupSpan {
            first: slot,
            last: slot,
            count: 0,
        });
        span.last = slot;
        span.count += 1;

        self.tables.ensure(u64::from(table.as_raw())).push(slot);
        self.len += 1;
        trace!(table = table.as_raw(), group, "query cache match added");
    }

    fn remove_slot(&mut self, slot: u32) {
        let (prev, next, key) = {
            let m = self.get(slot);
            (m.prev, m.next, self.group_key(m.group))
        };
        self.set_next(prev, next);
        self.set_prev(next, prev);

        if let Some(span) = self.groups.get_mut(&key) {
            span.count -= 1;
            if span.count == 0 {
                self.groups.remove(&key);
            } else {
                if span.first == slot {
                    span.first = next;
                }
                if span.last == slot {
                    span.last = prev;
                }
            }
        }

        self.matches[slot as usize] = None;
        self.free.push(slot);
        self.len -= 1;
    }

    /// Match a newly created table.
    pub(crate) fn on_table_create(&mut self, world: &World, table: TableId) {
        for (table, fields) in engine::collect_matches(world, &self.query, Some(table)) {
            self.insert(world, table, fields);
        }
    }

    /// Drop the matches of a deleted table.
    pub(crate) fn on_table_delete(&mut self, table: TableId) {
        self.sorted.remove(u64::from(table.as_raw()));
        let Some(slots) = self.tables.remove(u64::from(table.as_raw())) else {
            return;
        };
        for slot in slots {
            self.remove_slot(slot);
        }
        trace!(table = table.as_raw(), "query cache matches removed");
    }

    /// Match every table again. Groups are recomputed, so cascade depths
    /// follow reparenting. Change monitors carry over to matches with the
    /// same table, ids and sources.
    pub(crate) fn rematch(&mut self, world: &World) {
        let mut monitors = Vec::new();
        for m in self.matches.drain(..).flatten() {
            if let Some(monitor) = m.monitor {
                monitors.push((m.table, m.data, monitor));
            }
        }
        self.free.clear();
        self.first = NIL;
        self.last = NIL;
        self.tables.clear();
        self.groups.clear();
        self.len = 0;
        self.populate(world);

        let mut kept = 0usize;
        let mut slot = self.first;
        while slot != NIL && !monitors.is_empty() {
            let m = self.get_mut(slot);
            slot = m.next;
            let Some(monitor) = &mut m.monitor else {
                continue;
            };
            let found = monitors.iter().position(|(table, data, old)| {
                *table == m.table
                    && same_fields(data, &m.data)
                    && old.iter().map(|(index, _)| index).eq(monitor.iter().map(|(index, _)| index))
            });
            if let Some(found) = found {
                *monitor = monitors.swap_remove(found).2;
                kept += 1;
            }
        }
        debug!(matches = self.len, monitors_kept = kept, "rematched query cache");
    }

    /// Sort the rows of every matched table that changed since it was last
    /// sorted, and fix up the entity records of moved rows. Returns the
    /// number of tables that were reordered.
    pub(crate) fn sort_tables(&mut self, tables: &mut [Option<Table>], entities: &mut EntityIndex) -> usize {
        let Some(order_by) = self.order_by else {
            return 0;
        };
        let mut reordered = 0;
        let mut slot = self.first;
        while slot != NIL {
            let m = self.get(slot);
            slot = m.next;
            let Some(Some(table)) = tables.get_mut(m.table.index()) else {
                continue;
            };
            let column = order_by.id.and_then(|id| table.column_of(id));
            let stamp = |table: &Table| (table.dirty_counter(None), table.dirty_counter(column));
            let key = u64::from(m.table.as_raw());
            if self.sorted.get(key) == Some(&stamp(&*table)) {
                continue;
            }

            // SAFETY: `compare` was built for the type of the order_by
            // component, which is the type of `column`
            if unsafe { table.sort_rows(column, order_by.compare) } {
                for (row, &entity) in table.entities().iter().enumerate() {
                    if let Some(record) = entities.record_mut(entity) {
                        record.row = row as u32;
                    }
                }
                reordered += 1;
                trace!(table = m.table.as_raw(), "sorted table rows");
            }
            self.sorted.insert(key, stamp(&*table));
        }
        reordered
    }

    /// First slot to iterate, restricted to one group if given.
    pub(crate) fn first_slot(&self, group: Option<u64>) -> u32 {
        match group {
            Some(group) => self
                .groups
                .get(&self.group_key(group))
                .map_or(NIL, |span| span.first),
            None => self.first,
        }
    }

    /// Slot after `slot`, or [`NIL`] at the end of the list or the group.
    pub(crate) fn next_slot(&self, slot: u32, group: Option<u64>) -> u32 {
        let m = self.get(slot);
        if group.is_some_and(|group| {
            self.groups
                .get(&self.group_key(group))
                .is_some_and(|span| span.last == slot)
        }) {
            return NIL;
        }
        m.next
    }

    pub(crate) const fn is_nil(slot: u32) -> bool {
        slot == NIL
    }

    pub(crate) fn slot_table(&self, slot: u32) -> TableId {
        self.get(slot).table
    }

    pub(crate) fn table_slots(&self, table: TableId) -> &[u32] {
        self.tables.get(u64::from(table.as_raw())).map_or(&[][..], |slots| slots.as_slice())
    }

    /// Repoint up fields whose source entity moved to another table since
    /// the match was stored.
    pub(crate) fn refresh_up(&mut self, world: &World, slot: u32) {
        let MatchData::Full(fields) = &mut self.get_mut(slot).data else {
            return;
        };
        let mut up = fields.up_fields;
        while up != 0 {
            let field = up.trailing_zeros() as usize;
            up &= up - 1;
            let Some(src) = fields.sources[field] else {
                continue;
            };
            let Some(record) = world.entity_record(src) else {
                continue;
            };
            if fields.locs[field].table == Some(record.table) {
                continue;
            }
            let Some(table) = world.table(record.table) else {
                continue;
            };
            if table.has(fields.ids[field]) {
                fields.locs[field] = FieldLoc {
                    table: Some(record.table),
                    column: table.column_of(fields.ids[field]).map(|c| c as u16),
                };
                trace!(field, src = %src, "refreshed up field");
            }
        }
    }

    /// Copy the fields of a match into iterator state. Returns the set and
    /// up field masks.
    pub(crate) fn load(
        &self,
        slot: u32,
        ids: &mut [Id],
        sources: &mut [Option<Entity>],
        locs: &mut [FieldLoc],
    ) -> (u64, u64) {
        let m = self.get(slot);
        match &m.data {
            MatchData::Trivial { columns, set_fields } => {
                for (field, column) in columns.iter().enumerate() {
                    ids[field] = self.query.field_ids[field];
                    sources[field] = None;
                    locs[field] = FieldLoc {
                        table: Some(m.table),
                        column: *column,
                    };
                }
                (*set_fields, 0)
            }
            MatchData::Full(fields) => {
                // unset optional fields must not keep another match's state
                for (field, &id) in self.query.field_ids.iter().enumerate() {
                    ids[field] = id;
                    sources[field] = self.query.field_src[field];
                    locs[field] = FieldLoc::default();
                }
                let mut set = fields.set_fields;
                while set != 0 {
                    let field = set.trailing_zeros() as usize;
                    set &= set - 1;
                    ids[field] = fields.ids[field];
                    sources[field] = fields.sources[field];
                    locs[field] = fields.locs[field];
                }
                (fields.set_fields, fields.up_fields)
            }
        }
    }

    /// Whether the tracked state of a match changed since its last sync.
    pub(crate) fn slot_changed(&self, world: &World, slot: u32) -> bool {
        let m = self.get(slot);
        let Some(monitor) = &m.monitor else {
            return true;
        };
        let Some(table) = world.table(m.table) else {
            return false;
        };
        let dirty = table.dirty_state();
        monitor
            .iter()
            .any(|&(index, seen)| dirty[usize::from(index)].get() != seen)
    }

    pub(crate) fn sync(&mut self, world: &World, slot: u32) {
        let table = self.get(slot).table;
        let Some(table) = world.table(table) else {
            return;
        };
        let dirty = table.dirty_state();
        if let Some(monitor) = &mut self.get_mut(slot).monitor {
            for (index, seen) in monitor.iter_mut() {
                *seen = dirty[usize::from(*index)].get();
            }
        }
    }

    /// Whether any match changed since it was last iterated.
    pub(crate) fn changed(&self, world: &World) -> bool {
        let mut slot = self.first;
        while slot != NIL {
            if self.slot_changed(world, slot) {
                return true;
            }
            slot = self.get(slot).next;
        }
        false
    }
}

fn column_of(data: &MatchData, field: usize) -> Option<u16> {
    match data {
        MatchData::Trivial { columns, .. } => columns.get(field).copied().flatten(),
        MatchData::Full(fields) => fields.locs.get(field).and_then(|loc| loc.column),
    }
}

/// Whether two matches of the same table resolved to the same ids and
/// sources.
fn same_fields(a: &MatchData, b: &MatchData) -> bool {
    match (a, b) {
        (MatchData::Trivial { .. }, MatchData::Trivial { .. }) => true,
        (MatchData::Full(a), MatchData::Full(b)) => a.ids == b.ids && a.sources == b.sources,
        _ => false,
    }
}

fn is_self(data: &MatchData, field: usize) -> bool {
    match data {
        MatchData::Trivial { .. } => true,
        MatchData::Full(fields) => fields.sources.get(field).is_some_and(Option::is_none),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Entity, World,
        id::{CHILD_OF, Id, WILDCARD},
        query::{Query, builder::CacheKind, term::TermRef},
    };

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Velocity(f32);

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Tag;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct Rank(u32);

    fn iterated(world: &World, query: &Query) -> Vec<Entity> {
        let mut out = Vec::new();
        let mut it = query.iter(world);
        while it.next() {
            out.extend_from_slice(it.entities());
        }
        out
    }

    /// `c` is parented first, so its table exists before `b`'s; `b` is then
    /// moved under `a`, which pushes `c` one level deeper.
    fn reparented_chain(world: &mut World) -> [Entity; 3] {
        let [a, b, c] = [world.new_entity(), world.new_entity(), world.new_entity()];
        for e in [a, b, c] {
            world.set(e, Position::default()).unwrap();
        }
        world.add_pair(c, CHILD_OF, b).unwrap();
        world.add_pair(b, CHILD_OF, a).unwrap();
        [a, b, c]
    }

    #[test]
    fn test_new_table_is_matched_incrementally() {
        let mut world = World::new();
        let query = world.query().with::<Position>().cache_kind(CacheKind::Auto).build().unwrap();
        assert!(query.cached_tables(&world).is_empty());

        let e = world.new_entity();
        world.set(e, Position::default()).unwrap();
        world.set(e, Velocity(1.0)).unwrap();
        let table = world.table_of(e).unwrap();
        assert!(query.cached_tables(&world).contains(&table));

        // a table that does not have Position is not matched
        let other = world.new_entity();
        world.set(other, Velocity(2.0)).unwrap();
        assert!(!query.cached_tables(&world).contains(&world.table_of(other).unwrap()));
    }

    #[test]
    fn test_empty_tables_stay_matched() {
        let mut world = World::new();
        let query = world.query().with::<Position>().cache_kind(CacheKind::Auto).build().unwrap();
        let e = world.new_entity();
        world.set(e, Position::default()).unwrap();
        let table = world.table_of(e).unwrap();

        world.delete(e).unwrap();
        assert!(query.cached_tables(&world).contains(&table));
        assert_eq!(query.count(&world), 0);

        assert!(world.delete_empty_tables() > 0);
        assert!(!query.cached_tables(&world).contains(&table));
    }

    #[test]
    fn test_group_by_orders_matches() {
        let mut world = World::new();
        let p1 = world.new_entity();
        let p2 = world.new_entity();
        let query = world
            .query()
            .with::<Position>()
            .with_pair(CHILD_OF, TermRef::Wildcard)
            .cache_kind(CacheKind::Auto)
            .group_by(CHILD_OF)
            .build()
            .unwrap();

        // p2's table is created first but sorts after p1's group
        for parent in [p2, p1, p2] {
            let e = world.new_entity();
            world.set(e, Position::default()).unwrap();
            world.add_pair(e, CHILD_OF, parent).unwrap();
        }
        let tables = query.cached_tables(&world);
        let groups: Vec<_> = tables
            .iter()
            .map(|t| u64::from(world.table(*t).unwrap().parent().unwrap().index()))
            .collect();
        let mut sorted = groups.clone();
        sorted.sort_unstable();
        assert_eq!(groups, sorted);

        let mut it = query.iter(&world);
        it.set_group(u64::from(p2.index()));
        let mut seen = 0;
        while it.next() {
            assert_eq!(world.parent(it.entities()[0]), Some(p2));
            seen += it.count();
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_changed_tracks_writes() {
        let mut world = World::new();
        let query = world
            .query()
            .with::<Position>()
            .cache_kind(CacheKind::Auto)
            .detect_changes()
            .build()
            .unwrap();
        let e = world.new_entity();
        world.set(e, Position::default()).unwrap();
        assert!(query.changed(&world));

        let mut it = query.iter(&world);
        while it.next() {}
        drop(it);
        assert!(!query.changed(&world));

        world.set(e, Position { x: 1.0, y: 0.0 }).unwrap();
        assert!(query.changed(&world));

        let mut it = query.iter(&world);
        while it.next() {
            it.skip();
        }
        drop(it);
        assert!(query.changed(&world));
    }

    #[test]
    fn test_trivial_cache_single_match_per_table() {
        let mut world = World::new();
        let query = world
            .query()
            .with::<Position>()
            .with::<Tag>()
            .cache_kind(CacheKind::Auto)
            .build()
            .unwrap();
        assert!(query.is_trivial());
        for _ in 0..3 {
            let e = world.new_entity();
            world.set(e, Position::default()).unwrap();
            world.add::<Tag>(e).unwrap();
        }
        assert_eq!(query.cached_tables(&world).len(), 1);
        assert_eq!(query.count(&world), 3);
    }

    #[test]
    fn test_cascade_iterates_parents_before_children() {
        crate::init_test_tracing();
        let mut world = World::new();
        let query = world
            .query()
            .with::<Position>()
            .optional::<Position>()
            .cascade(CHILD_OF)
            .build()
            .unwrap();
        let [a, b, c] = reparented_chain(&mut world);
        assert_eq!(iterated(&world, &query), vec![a, b, c]);

        let mut it = query.iter(&world);
        it.set_group(2);
        assert!(it.next());
        assert_eq!(it.entities(), &[c]);
        assert!(!it.next());
    }

    #[test]
    fn test_cascade_desc_iterates_children_first() {
        let mut world = World::new();
        let query = world
            .query()
            .with::<Position>()
            .optional::<Position>()
            .cascade(CHILD_OF)
            .desc()
            .build()
            .unwrap();
        let [a, b, c] = reparented_chain(&mut world);
        assert_eq!(iterated(&world, &query), vec![c, b, a]);

        // a new root lands in the last group
        let d = world.new_entity();
        world.set(d, Position::default()).unwrap();
        let order = iterated(&world, &query);
        assert_eq!(&order[..2], &[c, b]);
        assert!(order[2..].contains(&a) && order[2..].contains(&d));
    }

    #[test]
    fn test_order_by_sorts_rows() {
        let mut world = World::new();
        let query = world.query().with::<Rank>().order_by::<Rank>().build().unwrap();
        let entities: Vec<_> = [5, 1, 4, 2, 3]
            .into_iter()
            .map(|rank| {
                let e = world.new_entity();
                world.set(e, Rank(rank)).unwrap();
                e
            })
            .collect();

        assert_eq!(query.sort(&mut world), 1);
        let mut ranks = Vec::new();
        let mut it = query.iter(&world);
        while it.next() {
            let field = it.field::<Rank>(0).unwrap();
            ranks.extend(field.iter().map(|r| r.0));
        }
        drop(it);
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        // records follow their rows
        for (e, rank) in entities.iter().zip([5, 1, 4, 2, 3]) {
            assert_eq!(world.get::<Rank>(*e), Some(&Rank(rank)));
        }
        assert_eq!(query.sort(&mut world), 0);

        world.set(entities[0], Rank(0)).unwrap();
        let mut it = query.iter_mut(&mut world);
        assert!(it.next());
        assert_eq!(it.entities()[0], entities[0]);
    }

    #[test]
    fn test_order_by_entity() {
        let mut world = World::new();
        let query = world.query().with::<Rank>().order_by_entity().build().unwrap();
        let first = world.new_entity();
        let second = world.new_entity();
        world.set(second, Rank(1)).unwrap();
        world.set(first, Rank(2)).unwrap();
        assert_eq!(iterated(&world, &query), vec![second, first]);

        query.sort(&mut world);
        assert_eq!(iterated(&world, &query), vec![first, second]);
        assert_eq!(world.get::<Rank>(first), Some(&Rank(2)));
    }

    #[test]
    fn test_reparent_keeps_change_state() {
        let mut world = World::new();
        let query = world
            .query()
            .with::<Position>()
            .with::<Velocity>()
            .up(CHILD_OF)
            .detect_changes()
            .build()
            .unwrap();
        let p1 = world.new_entity();
        world.set(p1, Velocity(1.0)).unwrap();
        let p2 = world.new_entity();
        world.set(p2, Velocity(2.0)).unwrap();
        let c1 = world.new_entity();
        world.set(c1, Position::default()).unwrap();
        world.add_pair(c1, CHILD_OF, p1).unwrap();
        let c2 = world.new_entity();
        world.set(c2, Position::default()).unwrap();
        world.add::<Tag>(c2).unwrap();
        world.add_pair(c2, CHILD_OF, p2).unwrap();

        let mut it = query.iter(&world);
        while it.next() {}
        drop(it);
        assert!(!query.changed(&world));

        // p1 changes table, which rematches the cache; c1 and c2 still
        // resolve Velocity the same way
        world.add_pair(p1, CHILD_OF, p2).unwrap();
        assert_eq!(iterated(&world, &query).len(), 2);
        assert!(!query.changed(&world));

        world.set(c1, Position { x: 1.0, y: 1.0 }).unwrap();
        assert!(query.changed(&world));
    }

    #[test]
    fn test_unset_optional_fields_reset_between_tables() {
        let mut world = World::new();
        let likes = world.new_entity();
        let apples = world.new_entity();
        let parent = world.new_entity();
        world.set(parent, Velocity(1.0)).unwrap();
        let query = world
            .query()
            .with::<Position>()
            .optional_id(Id::pair(likes, WILDCARD))
            .optional::<Velocity>()
            .up(CHILD_OF)
            .cache_kind(CacheKind::Auto)
            .build()
            .unwrap();

        let full = world.new_entity();
        world.set(full, Position::default()).unwrap();
        world.add_pair(full, likes, apples).unwrap();
        world.add_pair(full, CHILD_OF, parent).unwrap();
        // created after `full`'s table, so iterated after it
        let bare = world.new_entity();
        world.set(bare, Position::default()).unwrap();
        world.add::<Tag>(bare).unwrap();

        let mut it = query.iter(&world);
        let mut seen = 0;
        while it.next() {
            if it.entities() == [full] {
                assert!(it.is_set(1) && it.is_set(2));
                assert_eq!(it.field_id(1), Some(Id::pair(likes, apples)));
                assert_eq!(it.field_src(2), Some(parent));
            } else {
                assert_eq!(it.entities(), &[bare]);
                assert!(!it.is_set(1) && !it.is_set(2));
                assert_eq!(it.field_id(1), Some(Id::pair(likes, WILDCARD)));
                assert_eq!(it.field_src(2), None);
            }
            seen += 1;
        }
        assert_eq!(seen, 2);
    }
}
