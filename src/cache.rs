//! Processed-message dedup cache (§4.5).
//!
//! There's no direct Python analogue of this module in `original_source/`
//! (the reference firmware dedups with a single unbounded-ish list), so
//! this is built from the spec's description of a two-generation (A/B)
//! cache, each generation a map `uid -> message`: a bounded "current"
//! generation absorbs new entries, and once it fills, entries age into a
//! "previous" generation instead of being dropped outright, guaranteeing
//! every entry survives lookups for at least the configured minimum
//! lifetime before it can be evicted for good. Shaped like the teacher's
//! other bounded collections (`heapless` fixed-capacity types) even
//! though, being keyed and age-aware, it's built on `std::collections`
//! rather than `heapless` directly.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Generation<K, V> {
    map: HashMap<K, Entry<V>>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> Generation<K, V> {
    fn new() -> Self {
        Generation { map: HashMap::new(), order: VecDeque::new() }
    }

    fn insert(&mut self, key: K, value: V, now: Instant) {
        if self.map.insert(key.clone(), Entry { value, inserted_at: now }).is_none() {
            self.order.push_back(key);
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|e| &e.value)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key).map(|e| &mut e.value)
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn pop_front(&mut self) -> Option<(K, Entry<V>)> {
        let key = self.order.pop_front()?;
        let entry = self.map.remove(&key)?;
        Some((key, entry))
    }
}

/// Deduplicates keys (typically a Data message's `uid`) while retaining
/// the associated value — e.g. so a later Ack can look the original
/// message back up and update its ack-set — for a bounded amount of
/// memory, guaranteeing every inserted key is recognized as a duplicate
/// for at least `min_lifetime`.
pub struct ProcessedCache<K, V> {
    current: Generation<K, V>,
    previous: Generation<K, V>,
    capacity: usize,
    min_lifetime: Duration,
    promiscuous: bool,
}

impl<K: Eq + Hash + Clone, V> ProcessedCache<K, V> {
    pub fn new(capacity: usize, min_lifetime: Duration) -> Self {
        ProcessedCache {
            current: Generation::new(),
            previous: Generation::new(),
            capacity,
            min_lifetime,
            promiscuous: false,
        }
    }

    pub fn set_promiscuous(&mut self, on: bool) {
        self.promiscuous = on;
    }

    /// In promiscuous mode duplicates are still reported as seen (so a
    /// duplicate frame is never re-relayed), but the engine surfaces it
    /// anyway instead of silently dropping it.
    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous
    }

    pub fn is_duplicate(&self, key: &K) -> bool {
        self.current.contains(key) || self.previous.contains(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.current.get(key).or_else(|| self.previous.get(key))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.current.contains(key) {
            self.current.get_mut(key)
        } else {
            self.previous.get_mut(key)
        }
    }

    /// Record `key` (with its value) as processed. Returns `true` if it
    /// was newly inserted, `false` if it was already present (a
    /// duplicate, whose value is left untouched).
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> bool {
        if self.is_duplicate(&key) {
            return false;
        }
        self.current.insert(key, value, now);
        if self.current.len() > self.capacity {
            self.evict(now);
        }
        true
    }

    /// Pop entries out of the current generation until it's back within
    /// capacity, demoting still-young entries into the previous
    /// generation instead of dropping them, then rotate generations if
    /// the current one emptied out entirely.
    fn evict(&mut self, now: Instant) {
        while self.current.len() > self.capacity {
            let Some((key, entry)) = self.current.pop_front() else { break };
            if now.saturating_duration_since(entry.inserted_at) <= self.min_lifetime {
                self.previous.insert(key, entry.value, entry.inserted_at);
            }
        }
        if self.current.is_empty() && !self.previous.is_empty() {
            std::mem::swap(&mut self.current, &mut self.previous);
        }
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Property 5 (dedup): re-inserting the same key is rejected.
    #[test]
    fn duplicate_insert_is_rejected() {
        let mut cache: ProcessedCache<u32, ()> = ProcessedCache::new(4, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.insert(100, (), now));
        assert!(!cache.insert(100, (), now));
        assert!(cache.is_duplicate(&100));
    }

    #[test]
    fn capacity_is_bounded_under_sustained_inserts() {
        let mut cache: ProcessedCache<u32, ()> = ProcessedCache::new(4, Duration::from_secs(60));
        let now = Instant::now();
        for i in 0..100u32 {
            cache.insert(i, (), now);
        }
        assert!(cache.len() <= 8, "cache grew unbounded: {} entries", cache.len());
    }

    /// An entry younger than `min_lifetime` survives being pushed out of
    /// the current generation by demotion into the previous one.
    #[test]
    fn young_entries_survive_generation_rotation() {
        let mut cache: ProcessedCache<u32, ()> = ProcessedCache::new(2, Duration::from_secs(3600));
        let now = Instant::now();
        cache.insert(1, (), now);
        cache.insert(2, (), now);
        cache.insert(3, (), now); // forces eviction of key 1 out of `current`
        assert!(cache.is_duplicate(&1), "young entry should have been demoted, not dropped");
    }

    #[test]
    fn stale_entries_are_eventually_forgotten() {
        let mut cache: ProcessedCache<u32, ()> = ProcessedCache::new(1, Duration::from_millis(1));
        let t0 = Instant::now();
        cache.insert(1, (), t0);
        let later = t0 + Duration::from_millis(50);
        cache.insert(2, (), later); // evicts key 1, which is now older than min_lifetime
        assert!(!cache.is_duplicate(&1));
    }

    #[test]
    fn values_are_retrievable_and_mutable() {
        let mut cache: ProcessedCache<u32, Vec<u8>> = ProcessedCache::new(4, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert(1, vec![1], now);
        cache.get_mut(&1).unwrap().push(2);
        assert_eq!(cache.get(&1), Some(&vec![1, 2]));
    }
}
