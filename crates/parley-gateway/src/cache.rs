use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Small least-recently-used map. Recency is a monotonically increasing
/// tick; the oldest tick is evicted first.
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let tick = self.bump();
        let (_, old) = self.entries.get(key)?;
        let old = *old;
        self.order.remove(&old);
        self.order.insert(tick, key.clone());
        let entry = self.entries.get_mut(key)?;
        entry.1 = tick;
        Some(&mut entry.0)
    }

    /// Insert or replace. Returns the evicted entry, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.bump();
        if let Some((_, old)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&old);
        }
        self.order.insert(tick, key);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.order.pop_first()?;
        self.entries.remove(&oldest).map(|(v, _)| (oldest, v))
    }

    /// Insert unless the key is already present. Returns true if inserted.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.insert(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        // touch 1 so 2 becomes the oldest
        cache.get_mut(&1);
        let evicted = cache.insert(3, "c");
        assert_eq!(evicted, Some((2, "b")));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn insert_if_absent_keeps_existing_value() {
        let mut cache = LruCache::new(4);
        cache.insert("k", 1);
        assert!(!cache.insert_if_absent("k", 2));
        assert_eq!(cache.get_mut(&"k"), Some(&mut 1));
        assert!(cache.insert_if_absent("j", 3));
    }

    #[test]
    fn replacing_a_key_does_not_leak_order_slots() {
        let mut cache = LruCache::new(1);
        cache.insert(1, 1);
        cache.insert(1, 2);
        assert_eq!(cache.insert(2, 3), Some((1, 2)));
        assert!(cache.insert(2, 4).is_none());
        assert_eq!(cache.len(), 1);
    }
}
