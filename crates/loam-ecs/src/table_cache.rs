//! Index of the tables that contain one id.
//!
//! Nodes live in a slab and are chained into two doubly-linked lists, one
//! for tables with entities and one for empty tables, so callers can skip
//! empty tables without checking row counts. A map from table id to node
//! gives O(1) lookup and removal.

use loam_collections::Map;

use crate::table::TableId;

const NIL: u32 = u32::MAX;

/// Which tables an iteration visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheIterKind {
    /// Tables with at least one entity.
    Fill,
    /// Tables without entities.
    Empty,
    /// Both, non-empty tables first.
    All,
}

#[derive(Debug)]
struct Node<T> {
    table: TableId,
    prev: u32,
    next: u32,
    empty: bool,
    payload: T,
}

#[derive(Clone, Copy, Debug)]
struct List {
    first: u32,
    last: u32,
    count: u32,
}

impl List {
    const EMPTY: Self = Self {
        first: NIL,
        last: NIL,
        count: 0,
    };
}

/// Table cache with a payload of type `T` per table.
#[derive(Debug)]
pub struct TableCache<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<u32>,
    index: Map<u32>,
    /// `[non-empty, empty]`.
    lists: [List; 2],
}

impl<T> Default for TableCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TableCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: Map::new(),
            lists: [List::EMPTY; 2],
        }
    }

    fn node(&self, slot: u32) -> &Node<T> {
        match &self.nodes[slot as usize] {
            Some(node) => node,
            None => unreachable!("table cache slot {slot} is free"),
        }
    }

    fn node_mut(&mut self, slot: u32) -> &mut Node<T> {
        match &mut self.nodes[slot as usize] {
            Some(node) => node,
            None => unreachable!("table cache slot {slot} is free"),
        }
    }

    fn link(&mut self, slot: u32, empty: bool) {
        let list = usize::from(empty);
        let last = self.lists[list].last;
        {
            let node = self.node_mut(slot);
            node.prev = last;
            node.next = NIL;
            node.empty = empty;
        }
        if last == NIL {
            self.lists[list].first = slot;
        } else {
            self.node_mut(last).next = slot;
        }
        self.lists[list].last = slot;
        self.lists[list].count += 1;
    }

    fn unlink(&mut self, slot: u32) {
        let (prev, next, empty) = {
            let node = self.node(slot);
            (node.prev, node.next, node.empty)
        };
        let list = usize::from(empty);
        if prev == NIL {
            self.lists[list].first = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.lists[list].last = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        self.lists[list].count -= 1;
    }

    /// Insert `table` into the empty or non-empty list.
    ///
    /// # Panics
    ///
    /// Panics if the table is already present.
    pub fn insert(&mut self, table: TableId, empty: bool, payload: T) {
        assert!(
            !self.index.contains(u64::from(table.as_raw())),
            "table {table:?} inserted twice"
        );

        let node = Node {
            table,
            prev: NIL,
            next: NIL,
            empty,
            payload,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };
        self.index.insert(u64::from(table.as_raw()), slot);
        self.link(slot, empty);
    }

    /// Move a table between the lists. Returns `true` if it moved, `false` if
    /// it was already in the requested list or is not in the cache.
    pub fn set_empty(&mut self, table: TableId, empty: bool) -> bool {
        let Some(&slot) = self.index.get(u64::from(table.as_raw())) else {
            return false;
        };
        if self.node(slot).empty == empty {
            return false;
        }
        self.unlink(slot);
        self.link(slot, empty);
        true
    }

    /// Remove a table and return its payload.
    pub fn remove(&mut self, table: TableId) -> Option<T> {
        let slot = self.index.remove(u64::from(table.as_raw()))?;
        self.unlink(slot);
        self.free.push(slot);
        self.nodes[slot as usize].take().map(|node| node.payload)
    }

    #[must_use]
    pub fn get(&self, table: TableId) -> Option<&T> {
        let slot = *self.index.get(u64::from(table.as_raw()))?;
        Some(&self.node(slot).payload)
    }

    #[must_use]
    pub fn get_mut(&mut self, table: TableId) -> Option<&mut T> {
        let slot = *self.index.get(u64::from(table.as_raw()))?;
        Some(&mut self.node_mut(slot).payload)
    }

    #[must_use]
    pub fn contains(&self, table: TableId) -> bool {
        self.index.contains(u64::from(table.as_raw()))
    }

    /// Whether `table` is in the empty list.
    #[must_use]
    pub fn is_empty_table(&self, table: TableId) -> Option<bool> {
        let slot = *self.index.get(u64::from(table.as_raw()))?;
        Some(self.node(slot).empty)
    }

    /// Number of non-empty tables.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.lists[0].count
    }

    /// Number of empty tables.
    #[must_use]
    pub const fn empty_count(&self) -> u32 {
        self.lists[1].count
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.lists[0].count + self.lists[1].count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start an iteration.
    #[must_use]
    pub fn cursor(&self, kind: CacheIterKind) -> CacheCursor {
        let (list, node) = match kind {
            CacheIterKind::Fill | CacheIterKind::All => (0, self.lists[0].first),
            CacheIterKind::Empty => (1, self.lists[1].first),
        };
        CacheCursor { node, list, kind }
    }

    /// Advance a cursor.
    ///
    /// The cache must not be modified while a cursor over it is in use.
    pub fn next(&self, cursor: &mut CacheCursor) -> Option<(TableId, &T)> {
        while cursor.node == NIL {
            if cursor.kind == CacheIterKind::All && cursor.list == 0 {
                cursor.list = 1;
                cursor.node = self.lists[1].first;
            } else {
                return None;
            }
        }
        let node = self.node(cursor.node);
        cursor.node = node.next;
        Some((node.table, &node.payload))
    }

    pub fn iter(&self, kind: CacheIterKind) -> CacheIter<'_, T> {
        CacheIter {
            cache: self,
            cursor: self.cursor(kind),
        }
    }

    /// Tables with entities.
    pub fn iter_fill(&self) -> CacheIter<'_, T> {
        self.iter(CacheIterKind::Fill)
    }

    /// Tables without entities.
    pub fn iter_empty(&self) -> CacheIter<'_, T> {
        self.iter(CacheIterKind::Empty)
    }

    pub fn iter_all(&self) -> CacheIter<'_, T> {
        self.iter(CacheIterKind::All)
    }
}

/// Resumable position in a [`TableCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheCursor {
    node: u32,
    list: u8,
    kind: CacheIterKind,
}

pub struct CacheIter<'a, T> {
    cache: &'a TableCache<T>,
    cursor: CacheCursor,
}

impl<'a, T> Iterator for CacheIter<'a, T> {
    type Item = (TableId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.cache.next(&mut self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn t(raw: u32) -> TableId {
        TableId::from_raw(raw)
    }

    fn tables(iter: CacheIter<'_, u32>) -> Vec<u32> {
        iter.map(|(table, _)| table.as_raw()).collect()
    }

    #[test]
    fn test_insert_remove_round_trip() {
        let mut cache = TableCache::new();
        cache.insert(t(1), false, 10u32);
        cache.insert(t(2), true, 20);
        let before = (cache.count(), cache.empty_count());

        cache.insert(t(3), false, 30);
        assert_eq!(cache.get(t(3)), Some(&30));
        assert_eq!(cache.remove(t(3)), Some(30));
        assert_eq!((cache.count(), cache.empty_count()), before);
        assert!(!cache.contains(t(3)));
        assert_eq!(cache.remove(t(3)), None);
    }

    #[test]
    fn test_iterate_after_insert_yields_table() {
        let mut cache = TableCache::new();
        cache.insert(t(7), false, 0u32);
        assert_eq!(tables(cache.iter_fill()), vec![7]);
        assert!(tables(cache.iter_empty()).is_empty());
    }

    #[test]
    fn test_set_empty_moves_between_lists() {
        let mut cache = TableCache::new();
        cache.insert(t(1), false, 0u32);
        cache.insert(t(2), false, 0);
        cache.insert(t(3), false, 0);

        assert!(cache.set_empty(t(2), true));
        assert!(!cache.set_empty(t(2), true));
        assert_eq!(tables(cache.iter_fill()), vec![1, 3]);
        assert_eq!(tables(cache.iter_empty()), vec![2]);
        assert_eq!(tables(cache.iter_all()), vec![1, 3, 2]);

        assert!(cache.set_empty(t(2), false));
        assert_eq!(tables(cache.iter_fill()), vec![1, 3, 2]);
        assert!(!cache.set_empty(t(99), true));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut cache = TableCache::new();
        cache.insert(t(1), false, 0u32);
        cache.remove(t(1));
        cache.insert(t(2), false, 0);
        assert_eq!(cache.nodes.len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, bool),
        SetEmpty(u8, bool),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, any::<bool>()).prop_map(|(t, e)| Op::Insert(t, e)),
            (0u8..16, any::<bool>()).prop_map(|(t, e)| Op::SetEmpty(t, e)),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn test_partition_invariant(ops in prop::collection::vec(op(), 0..200)) {
            let mut cache = TableCache::new();
            let mut model: std::collections::BTreeMap<u32, bool> = Default::default();

            for op in ops {
                match op {
                    Op::Insert(table, empty) => {
                        let table = u32::from(table);
                        if !model.contains_key(&table) {
                            cache.insert(t(table), empty, table);
                            model.insert(table, empty);
                        }
                    }
                    Op::SetEmpty(table, empty) => {
                        let table = u32::from(table);
                        let moved = cache.set_empty(t(table), empty);
                        let expected = model.get(&table).is_some_and(|&e| e != empty);
                        prop_assert_eq!(moved, expected);
                        if let Some(e) = model.get_mut(&table) {
                            *e = empty;
                        }
                    }
                    Op::Remove(table) => {
                        let table = u32::from(table);
                        prop_assert_eq!(cache.remove(t(table)), model.remove(&table).map(|_| table));
                    }
                }

                let mut empty = tables(cache.iter_empty());
                let mut fill = tables(cache.iter_fill());
                empty.sort_unstable();
                fill.sort_unstable();
                let model_empty: Vec<u32> =
                    model.iter().filter(|(_, e)| **e).map(|(t, _)| *t).collect();
                let model_fill: Vec<u32> =
                    model.iter().filter(|(_, e)| !**e).map(|(t, _)| *t).collect();
                prop_assert_eq!(empty, model_empty);
                prop_assert_eq!(fill, model_fill);
                prop_assert_eq!(cache.len() as usize, model.len());
            }
        }
    }
}
