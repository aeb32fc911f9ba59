use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A map whose entries expire `ttl` after insertion.
///
/// Expired entries are pruned lazily on every read or write, so callers never
/// observe a stale value and the map never needs a background sweeper.
#[derive(Debug)]
pub struct TtlMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash + Clone, V> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Drop every expired entry and return how many were removed.
    pub fn prune(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, (inserted, _)| now.duration_since(*inserted) < ttl);
        before - self.entries.len()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.prune();
        self.entries
            .insert(key, (Instant::now(), value))
            .map(|(_, v)| v)
    }

    /// Insert only when no live entry exists for `key`.
    /// Returns `false` (leaving the existing entry untouched) otherwise.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        self.prune();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, (Instant::now(), value));
        true
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.prune();
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.prune();
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.prune();
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn len(&mut self) -> usize {
        self.prune();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_entries_are_visible() {
        let mut map = TtlMap::new(Duration::from_secs(60));
        assert!(map.insert_if_absent("a".to_string(), 1));
        assert!(!map.insert_if_absent("a".to_string(), 2));
        assert_eq!(map.get(&"a".to_string()), Some(&1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn expired_entries_are_pruned_on_read() {
        let mut map = TtlMap::new(Duration::from_millis(20));
        map.insert("nonce", ());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!map.contains_key(&"nonce"));
        assert!(map.is_empty());
        assert!(map.insert_if_absent("nonce", ()));
    }

    #[test]
    fn remove_returns_value() {
        let mut map = TtlMap::new(Duration::from_secs(1));
        map.insert(7u32, "seven");
        assert_eq!(map.remove(&7), Some("seven"));
        assert_eq!(map.remove(&7), None);
    }
}
