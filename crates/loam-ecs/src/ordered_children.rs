//! Explicit child order for parents with the `OrderedChildren` trait.

use hashbrown::HashSet;
use rustc_hash::FxHashMap;

use crate::entity::Entity;

/// Children of one parent in a caller-controlled order.
///
/// Removal leaves a tombstone so it stays O(1); the list is compacted once
/// tombstones outnumber live children.
#[derive(Debug, Default, Clone)]
pub struct OrderedChildren {
    slots: Vec<Option<Entity>>,
    position: FxHashMap<Entity, u32>,
    tombstones: usize,
}

impl OrderedChildren {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.position.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    #[must_use]
    pub fn contains(&self, child: Entity) -> bool {
        self.position.contains_key(&child)
    }

    /// Append a child. Does nothing if it is already present.
    pub fn push(&mut self, child: Entity) {
        if self.position.contains_key(&child) {
            return;
        }
        self.position.insert(child, self.slots.len() as u32);
        self.slots.push(Some(child));
    }

    /// Remove a child. Returns `false` if it was not present.
    pub fn remove(&mut self, child: Entity) -> bool {
        let Some(slot) = self.position.remove(&child) else {
            return false;
        };
        self.slots[slot as usize] = None;
        self.tombstones += 1;
        if self.tombstones > 8 && self.tombstones > self.position.len() {
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.tombstones = 0;
        for (slot, child) in self.slots.iter().enumerate() {
            if let Some(child) = child {
                self.position.insert(*child, slot as u32);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots.iter().filter_map(|child| *child)
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Entity> {
        self.iter().collect()
    }

    /// Replace the order with `order`, which must contain every current
    /// child exactly once and nothing else. Returns `false` and leaves the
    /// order unchanged otherwise.
    #[must_use]
    pub fn reorder(&mut self, order: &[Entity]) -> bool {
        if order.len() != self.position.len() {
            return false;
        }

        let mut seen = HashSet::new();
        for &child in order {
            if !self.position.contains_key(&child) || !seen.insert(child) {
                return false;
            }
        }

        self.slots.clear();
        self.slots.extend(order.iter().copied().map(Some));
        self.tombstones = 0;
        for (slot, child) in order.iter().enumerate() {
            self.position.insert(*child, slot as u32);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> Entity {
        Entity::from_index(index)
    }

    #[test]
    fn test_push_remove_keeps_order() {
        let mut children = OrderedChildren::new();
        for i in 1..=4 {
            children.push(e(i));
        }
        children.push(e(2));
        assert!(children.remove(e(2)));
        assert!(!children.remove(e(2)));
        assert_eq!(children.to_vec(), vec![e(1), e(3), e(4)]);
        assert_eq!(children.len(), 3);
    }

    #[test]
    fn test_compaction_preserves_order() {
        let mut children = OrderedChildren::new();
        for i in 1..=40 {
            children.push(e(i));
        }
        for i in (1..=40).filter(|i| i % 3 != 0) {
            assert!(children.remove(e(i)));
        }
        let expected: Vec<_> = (1..=40).filter(|i| i % 3 == 0).map(e).collect();
        assert_eq!(children.to_vec(), expected);
        assert!(children.slots.len() < 40);
        assert!(children.remove(e(3)));
        assert!(!children.contains(e(3)));
    }

    #[test]
    fn test_reorder_accepts_permutation() {
        let mut children = OrderedChildren::new();
        children.push(e(1));
        children.push(e(2));
        assert!(children.reorder(&[e(2), e(1)]));
        assert_eq!(children.to_vec(), vec![e(2), e(1)]);
    }

    #[test]
    fn test_reorder_rejects_missing_or_duplicate() {
        let mut children = OrderedChildren::new();
        children.push(e(1));
        children.push(e(2));
        assert!(children.reorder(&[e(2), e(1)]));

        assert!(!children.reorder(&[e(1)]));
        assert!(!children.reorder(&[e(1), e(1)]));
        assert!(!children.reorder(&[e(1), e(9)]));
        assert!(!children.reorder(&[e(1), e(2), e(2)]));
        assert_eq!(children.to_vec(), vec![e(2), e(1)]);
    }
}
