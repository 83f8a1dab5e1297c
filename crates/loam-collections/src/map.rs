//! Map from 64-bit keys to values.
//!
//! Backed by an open-addressed `hashbrown` table with the Fx hasher, which
//! is a good fit for ids that are already well distributed.

use hashbrown::hash_map::{self, Entry};
use rustc_hash::FxBuildHasher;

/// Open-addressed map keyed by `u64`.
#[derive(Clone)]
pub struct Map<V> {
    inner: hashbrown::HashMap<u64, V, FxBuildHasher>,
}

impl<V> Map<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: hashbrown::HashMap::with_hasher(FxBuildHasher),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: hashbrown::HashMap::with_capacity_and_hasher(capacity, FxBuildHasher),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: u64) -> Option<&V> {
        self.inner.get(&key)
    }

    #[must_use]
    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        self.inner.get_mut(&key)
    }

    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.inner.contains_key(&key)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: u64, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Return the value for `key`, creating it with `f` if missing.
    pub fn ensure_with(&mut self, key: u64, f: impl FnOnce() -> V) -> &mut V {
        match self.inner.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(f()),
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        self.inner.remove(&key)
    }

    pub fn retain(&mut self, f: impl FnMut(&u64, &mut V) -> bool) {
        self.inner.retain(f);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> {
        self.inner.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut V)> {
        self.inner.iter_mut().map(|(k, v)| (*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.inner.keys().copied()
    }

    pub fn values(&self) -> hash_map::Values<'_, u64, V> {
        self.inner.values()
    }

    pub fn values_mut(&mut self) -> hash_map::ValuesMut<'_, u64, V> {
        self.inner.values_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u64, V)> + '_ {
        self.inner.drain()
    }
}

impl<V: Default> Map<V> {
    /// Return the value for `key`, inserting `V::default()` if missing.
    pub fn ensure(&mut self, key: u64) -> &mut V {
        self.ensure_with(key, V::default)
    }
}

impl<V> Default for Map<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for Map<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.inner.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut map = Map::new();
        assert!(map.insert(1 << 63 | 5, "pair").is_none());
        assert_eq!(map.insert(1 << 63 | 5, "again"), Some("pair"));
        assert_eq!(map.get(1 << 63 | 5), Some(&"again"));
        assert_eq!(map.remove(1 << 63 | 5), Some("again"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_ensure_default() {
        let mut map: Map<Vec<u32>> = Map::new();
        map.ensure(7).push(1);
        map.ensure(7).push(2);
        assert_eq!(map.get(7).map(Vec::len), Some(2));
        assert_eq!(map.len(), 1);
    }
}
