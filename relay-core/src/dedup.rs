//! Bounded, TTL'd cache of inbound message ids to suppress redelivered
//! webhook events.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Capacity eviction is a memory bound, not a correctness mechanism: false
/// negatives after eviction are accepted, false positives never occur.
pub struct DedupCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic check-and-insert: true on first sighting, false when the id
    /// was already seen within its TTL window. Expired entries are evicted
    /// lazily here; when the hard capacity bound is hit, the oldest entries
    /// go first.
    pub fn check_and_insert(&self, message_id: &str) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        entries.retain(|_, first_seen| now.duration_since(*first_seen) <= self.ttl);

        if entries.contains_key(message_id) {
            return false;
        }

        if entries.len() >= self.capacity {
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, first_seen)| *first_seen);
            let excess = entries.len() + 1 - self.capacity;
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        entries.insert(message_id.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl_is_suppressed() {
        let cache = DedupCache::new(Duration::from_secs(300), 100);
        assert!(cache.check_and_insert("msg-1"));
        assert!(!cache.check_and_insert("msg-1"));
        assert!(cache.check_and_insert("msg-2"));
    }

    #[test]
    fn expired_entries_may_be_processed_again() {
        let cache = DedupCache::new(Duration::from_millis(20), 100);
        assert!(cache.check_and_insert("msg-1"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.check_and_insert("msg-1"));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let cache = DedupCache::new(Duration::from_secs(300), 2);
        assert!(cache.check_and_insert("oldest"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.check_and_insert("middle"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.check_and_insert("newest"));

        assert_eq!(cache.len(), 2);
        // The evicted oldest id is processable again; the newer ones are not.
        assert!(cache.check_and_insert("oldest"));
        assert!(!cache.check_and_insert("newest"));
    }
}
