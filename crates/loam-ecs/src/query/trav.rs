//! Relationship traversal caches.
//!
//! An up walk starts at a table and follows `(R, parent)` pairs until it
//! finds an ancestor that owns the component. A down walk starts at an
//! entity that owns the component and collects, breadth-first, every table
//! that reaches it through `(R, child)` pairs. Both are memoized for the
//! lifetime of one cache instance, which lives as long as one iteration.

use hashbrown::HashSet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    World,
    entity::{Entity, EntityFlags},
    id::{CHILD_OF, IS_A, Id, WILDCARD},
    table::{Table, TableId},
};

/// Where an up walk found the component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpMatch {
    /// The ancestor that owns the component.
    pub src: Entity,
    /// Table of `src` at the time of the walk.
    pub table: TableId,
    /// Column of the component in `table`, `None` for tags and sparse
    /// components.
    pub column: Option<usize>,
}

/// A table found by a down walk, and the entity its rows inherit from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownMatch {
    pub table: TableId,
    pub src: Entity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dir {
    None,
    Up,
    Down,
}

/// Memo for up or down walks over one `(relationship, component)` pair.
///
/// An instance serves one direction until [`TravCache::fini`]; using it for
/// the other direction first panics.
#[derive(Debug)]
pub struct TravCache {
    dir: Dir,
    rel: Entity,
    with: Id,
    self_: bool,
    up: FxHashMap<TableId, Option<UpMatch>>,
    down: FxHashMap<Entity, Vec<DownMatch>>,
}

impl Default for TravCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Type index of `with` in `table`.
fn owns(table: &Table, with: Id) -> Option<usize> {
    table.type_index(with)
}

/// Targets of `(rel, *)` pairs in `table`, in type order.
fn targets(world: &World, table: &Table, rel: Entity) -> SmallVec<[Entity; 4]> {
    if rel == CHILD_OF {
        return table.parent().into_iter().collect();
    }
    let Some(tr) = world
        .component_record(Id::pair(rel, WILDCARD))
        .and_then(|record| record.table_record(table.id()))
    else {
        return SmallVec::new();
    };
    let start = usize::from(tr.index);
    table.type_ids()[start..start + usize::from(tr.count)]
        .iter()
        .filter_map(|id| world.entity_at(id.second()))
        .collect()
}

impl TravCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: Dir::None,
            rel: Entity::from_index(0),
            with: Id::NULL,
            self_: false,
            up: FxHashMap::default(),
            down: FxHashMap::default(),
        }
    }

    /// Forget everything, including the direction.
    pub fn fini(&mut self) {
        self.dir = Dir::None;
        self.with = Id::NULL;
        self.up.clear();
        self.down.clear();
    }

    fn reset_for(&mut self, dir: Dir, rel: Entity, with: Id, self_: bool) {
        assert!(
            self.dir == Dir::None || self.dir == dir,
            "traversal cache used for both directions without fini"
        );
        self.dir = dir;
        if self.rel != rel || self.with != with || self.self_ != self_ {
            self.rel = rel;
            self.with = with;
            self.self_ = self_;
            self.up.clear();
            self.down.clear();
        }
    }

    /// Nearest ancestor of the rows of `table`, following `rel`, that owns
    /// `with`. The table itself is not checked.
    pub fn up(&mut self, world: &World, table: TableId, rel: Entity, with: Id) -> Option<UpMatch> {
        self.reset_for(Dir::Up, rel, with, false);
        self.up_table(world, table)
    }

    /// Depth-first walk with an explicit stack. Every table on the stack has
    /// a `None` placeholder in the memo, so a cycle back to it is a miss.
    fn up_table(&mut self, world: &World, table: TableId) -> Option<UpMatch> {
        if let Some(found) = self.up.get(&table) {
            return *found;
        }
        let inherit = self.rel != IS_A && world.is_inheritable(self.with);

        let mut stack: Vec<(TableId, SmallVec<[Entity; 4]>, usize)> = Vec::new();
        self.up.insert(table, None);
        stack.push((table, self.targets_of(world, table), 0));

        let mut found = None;
        while let Some((_, targets, next)) = stack.last_mut() {
            let Some(&target) = targets.get(*next) else {
                // exhausted; the placeholder becomes the result
                stack.pop();
                continue;
            };
            *next += 1;

            let Some(record) = world.entity_record(target) else {
                continue;
            };
            let Some(target_table) = world.table(record.table) else {
                continue;
            };
            if let Some(index) = owns(target_table, self.with) {
                found = Some(UpMatch {
                    src: target,
                    table: record.table,
                    column: target_table.column_of_index(index),
                });
                break;
            }
            if inherit && let Some(base) = isa_owner(world, target_table, self.with) {
                found = Some(base);
                break;
            }
            match self.up.get(&record.table) {
                Some(Some(memo)) => {
                    found = Some(*memo);
                    break;
                }
                Some(None) => {}
                None => {
                    self.up.insert(record.table, None);
                    let targets = self.targets_of(world, record.table);
                    stack.push((record.table, targets, 0));
                }
            }
        }

        if found.is_some() {
            for (table, ..) in stack {
                self.up.insert(table, found);
            }
        }
        found
    }

    fn targets_of(&self, world: &World, table: TableId) -> SmallVec<[Entity; 4]> {
        world
            .table(table)
            .map(|table| targets(world, table, self.rel))
            .unwrap_or_default()
    }

    /// Tables that reach `root` through `rel` and see its `with` component,
    /// breadth-first. With `self_`, tables that own `with` themselves are
    /// left out, since they match on their own.
    pub fn down(&mut self, world: &World, rel: Entity, with: Id, self_: bool, root: Entity) -> &[DownMatch] {
        self.reset_for(Dir::Down, rel, with, self_);
        if !self.down.contains_key(&root) {
            let found = self.walk_down(world, root);
            self.down.insert(root, found);
        }
        self.down.get(&root).map_or(&[][..], Vec::as_slice)
    }

    fn walk_down(&self, world: &World, root: Entity) -> Vec<DownMatch> {
        let inherit = self.rel != IS_A && world.is_inheritable(self.with);
        let mut found = Vec::new();
        let mut tables = HashSet::new();
        let mut nodes = HashSet::new();
        let mut frontier = vec![root];
        nodes.insert(root);

        let mut i = 0;
        while i < frontier.len() {
            let node = frontier[i];
            i += 1;

            if inherit {
                // instances see the component through their base
                if let Some(record) = world.component_record(Id::pair(IS_A, node)) {
                    for (table, _) in record.cache().iter_fill() {
                        let Some(table) = world.table(table) else {
                            continue;
                        };
                        if owns(table, self.with).is_some() {
                            continue;
                        }
                        for &instance in table.entities() {
                            if nodes.insert(instance) {
                                frontier.push(instance);
                            }
                        }
                    }
                }
            }

            let Some(record) = world.component_record(Id::pair(self.rel, node)) else {
                continue;
            };
            for (table_id, _) in record.cache().iter_all() {
                let Some(table) = world.table(table_id) else {
                    continue;
                };
                if owns(table, self.with).is_some() {
                    // leaf: rows own the component, so their descendants see
                    // theirs, not ours
                    if !self.self_ && tables.insert(table_id) {
                        found.push(DownMatch { table: table_id, src: root });
                    }
                    continue;
                }
                if targets(world, table, self.rel).len() > 1 {
                    // reachable through several edges: the first one that
                    // resolves wins
                    let mut up = TravCache::new();
                    if up.up(world, table_id, self.rel, self.with).map(|m| m.src) != Some(root) {
                        continue;
                    }
                }
                if !tables.insert(table_id) {
                    continue;
                }
                found.push(DownMatch { table: table_id, src: root });

                if table.traversable_count() > 0 {
                    for &entity in table.entities() {
                        let traversable = world
                            .entity_record(entity)
                            .is_some_and(|r| r.flags.contains(EntityFlags::TRAVERSABLE));
                        if traversable && nodes.insert(entity) {
                            frontier.push(entity);
                        }
                    }
                }
            }
        }
        found
    }
}

/// Base reachable through `IsA` from the rows of `table` that owns `with`.
/// Bases are searched depth-first in type order; each table is visited once.
fn isa_owner(world: &World, table: &Table, with: Id) -> Option<UpMatch> {
    let mut visited = HashSet::new();
    visited.insert(table.id());
    let mut stack: Vec<Entity> = targets(world, table, IS_A).into_iter().rev().collect();
    while let Some(base) = stack.pop() {
        let Some(record) = world.entity_record(base) else {
            continue;
        };
        let Some(base_table) = world.table(record.table) else {
            continue;
        };
        if let Some(index) = owns(base_table, with) {
            return Some(UpMatch {
                src: base,
                table: record.table,
                column: base_table.column_of_index(index),
            });
        }
        if visited.insert(record.table) {
            stack.extend(targets(world, base_table, IS_A).into_iter().rev());
        }
    }
    None
}

/// Number of `rel` hops from the rows of `table` to a root. Only the first
/// target of each table is followed; a cycle stops the count.
pub fn relation_depth(world: &World, table: &Table, rel: Entity) -> u32 {
    let mut visited = HashSet::new();
    visited.insert(table.id());
    let mut depth = 0;
    let mut next = targets(world, table, rel).first().copied();
    while let Some(target) = next {
        depth += 1;
        let Some(target_table) = world
            .entity_record(target)
            .and_then(|record| world.table(record.table))
        else {
            break;
        };
        if !visited.insert(target_table.id()) {
            break;
        }
        next = targets(world, target_table, rel).first().copied();
    }
    depth
}
