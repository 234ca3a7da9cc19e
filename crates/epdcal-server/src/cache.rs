//! TTL snapshot cache for HTTP responses.
//!
//! `/api/events` and `/api/battery` are backed by 30-second snapshots so
//! UI polling does not re-run fetch/parse/expand or touch I2C on every
//! request. Readers always see the last published snapshot.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::trace;

/// A keyed cache where entries expire `ttl` after insertion.
#[derive(Debug)]
pub struct SnapshotCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (V, Instant)>,
}

impl<K: Eq + Hash, V: Clone> SnapshotCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns a clone of the snapshot for `key`, if still fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        let (value, stored_at) = self.entries.get(key)?;
        if stored_at.elapsed() < self.ttl {
            Some(value.clone())
        } else {
            None
        }
    }

    /// Publishes a fresh snapshot for `key`.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now()));
    }

    /// Drops expired snapshots; returns the number evicted.
    pub fn evict_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(evicted, "evicted expired snapshots");
        }
        evicted
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
    use std::thread;

    #[test]
    fn fresh_snapshot_is_served() {
        let mut cache = SnapshotCache::new(Duration::from_secs(30));
        cache.insert("events", 42);
        assert_eq!(cache.get(&"events"), Some(42));
        assert_eq!(cache.get(&"battery"), None);
    }

    #[test]
    fn snapshot_expires() {
        let mut cache = SnapshotCache::new(Duration::from_millis(30));
        cache.insert("events", 1);
        assert_eq!(cache.get(&"events"), Some(1));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"events"), None);
    }

    #[test]
    fn insert_replaces_and_refreshes() {
        let mut cache = SnapshotCache::new(Duration::from_millis(50));
        cache.insert("k", 1);
        thread::sleep(Duration::from_millis(30));
        cache.insert("k", 2);
        thread::sleep(Duration::from_millis(30));
        // The second insert reset the clock.
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn evict_expired_removes_only_stale() {
        let mut cache = SnapshotCache::new(Duration::from_millis(30));
        cache.insert("old", 1);
        thread::sleep(Duration::from_millis(40));
        cache.insert("new", 2);

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"new"), Some(2));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let mut cache = SnapshotCache::new(Duration::from_secs(30));
        cache.insert((7, 1), "week");
        cache.insert((14, 0), "fortnight");
        assert_eq!(cache.get(&(7, 1)), Some("week"));
        assert_eq!(cache.get(&(14, 0)), Some("fortnight"));
    }
}
