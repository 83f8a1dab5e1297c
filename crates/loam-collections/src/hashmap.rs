//! Hashmap for keys of arbitrary size.
//!
//! Keys are hashed to 64 bits with a caller-supplied function; each hash
//! value owns a bucket in a [`Map`]. Colliding keys share the bucket and are
//! told apart with the caller-supplied compare function.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::map::Map;

/// Hash callback.
pub type HashFn<K> = fn(&K) -> u64;

/// Equality callback. Returns `true` when both keys are the same.
pub type CompareFn<K> = fn(&K, &K) -> bool;

/// Fx hash of any hashable value, a convenient [`HashFn`] building block.
#[must_use]
pub fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone)]
struct Bucket<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K, V> Bucket<K, V> {
    fn find(&self, key: &K, compare: CompareFn<K>) -> Option<usize> {
        self.keys.iter().position(|k| compare(k, key))
    }
}

/// Map from arbitrary keys to values with user-supplied hashing.
#[derive(Clone)]
pub struct HashMap<K, V> {
    hash: HashFn<K>,
    compare: CompareFn<K>,
    buckets: Map<Bucket<K, V>>,
    len: usize,
}

impl<K, V> HashMap<K, V> {
    #[must_use]
    pub fn new(hash: HashFn<K>, compare: CompareFn<K>) -> Self {
        Self {
            hash,
            compare,
            buckets: Map::new(),
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of hash buckets currently allocated.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let bucket = self.buckets.get((self.hash)(key))?;
        let index = bucket.find(key, self.compare)?;
        Some(&bucket.values[index])
    }

    #[must_use]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let compare = self.compare;
        let bucket = self.buckets.get_mut((self.hash)(key))?;
        let index = bucket.find(key, compare)?;
        Some(&mut bucket.values[index])
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Return the slot for `key`, appending `f()` if the key is new.
    pub fn ensure_with(&mut self, key: K, f: impl FnOnce() -> V) -> &mut V {
        let compare = self.compare;
        let bucket = self.buckets.ensure_with((self.hash)(&key), || Bucket {
            keys: Vec::new(),
            values: Vec::new(),
        });

        let index = match bucket.find(&key, compare) {
            Some(index) => index,
            None => {
                bucket.keys.push(key);
                bucket.values.push(f());
                self.len += 1;
                bucket.values.len() - 1
            }
        };
        &mut bucket.values[index]
    }

    /// Insert a value, returning the previous one for an equal key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let compare = self.compare;
        let bucket = self.buckets.ensure_with((self.hash)(&key), || Bucket {
            keys: Vec::new(),
            values: Vec::new(),
        });

        if let Some(index) = bucket.find(&key, compare) {
            return Some(std::mem::replace(&mut bucket.values[index], value));
        }
        bucket.keys.push(key);
        bucket.values.push(value);
        self.len += 1;
        None
    }

    /// Remove `key`. A bucket left without keys is freed.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = (self.hash)(key);
        let compare = self.compare;
        let bucket = self.buckets.get_mut(hash)?;
        let index = bucket.find(key, compare)?;

        bucket.keys.swap_remove(index);
        let value = bucket.values.swap_remove(index);
        if bucket.keys.is_empty() {
            self.buckets.remove(hash);
        }
        self.len -= 1;
        Some(value)
    }

    /// Iterate all pairs in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.keys.iter().zip(bucket.values.iter()))
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

impl<K, V: Default> HashMap<K, V> {
    /// Return the slot for `key`, appending a default value if missing.
    pub fn ensure(&mut self, key: K) -> &mut V {
        self.ensure_with(key, V::default)
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for HashMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Key = &'static str;

    fn hash_key(key: &Key) -> u64 {
        hash_of(*key)
    }

    fn eq_key(a: &Key, b: &Key) -> bool {
        a == b
    }

    fn collide(_: &Key) -> u64 {
        42
    }

    #[test]
    fn test_insert_and_get() {
        let mut map = HashMap::new(hash_key, eq_key);
        map.insert("position", 1);
        map.insert("velocity", 2);
        assert_eq!(map.get(&"position"), Some(&1));
        assert_eq!(map.get(&"velocity"), Some(&2));
        assert_eq!(map.get(&"mass"), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_ensure_constructs_in_place() {
        let mut map: HashMap<Key, Vec<u32>> = HashMap::new(hash_key, eq_key);
        map.ensure("a").push(1);
        map.ensure("a").push(2);
        assert_eq!(map.get(&"a"), Some(&vec![1, 2]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_collisions_share_a_bucket() {
        let mut map = HashMap::new(collide, eq_key);
        map.insert("one", 1);
        map.insert("two", 2);
        map.insert("three", 3);
        assert_eq!(map.bucket_count(), 1);
        assert_eq!(map.get(&"two"), Some(&2));

        assert_eq!(map.remove(&"one"), Some(1));
        assert_eq!(map.get(&"three"), Some(&3));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_remove_frees_empty_bucket() {
        let mut map = HashMap::new(collide, eq_key);
        map.insert("a", ());
        map.insert("b", ());
        map.remove(&"a");
        assert_eq!(map.bucket_count(), 1);
        map.remove(&"b");
        assert_eq!(map.bucket_count(), 0);
        assert!(map.is_empty());
        assert_eq!(map.remove(&"b"), None);
    }

    #[test]
    fn test_iter_visits_everything() {
        const KEYS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];
        let mut map = HashMap::new(hash_key, eq_key);
        for (i, key) in KEYS.iter().enumerate() {
            map.insert(*key, i);
        }
        let mut seen: Vec<usize> = map.iter().map(|(_, v)| *v).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..KEYS.len()).collect::<Vec<_>>());
    }
}
