//! Directly-heard neighbor tracking (§4.4).
//!
//! There's no standalone neighbor-table module in `original_source/`
//! (the Python firmware folds this into `freakwan.py`'s main loop and a
//! plain dict); this is built from the spec's description, shaped like
//! [`crate::cache::ProcessedCache`]'s bounded-map style for consistency
//! within this crate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::NodeId;

/// Entries older than this are considered gone and evicted on access.
pub const NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Maximum number of neighbors tracked at once.
pub const MAX_NEIGHBORS: usize = 32;

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub nick: String,
    pub last_rssi: i16,
    pub last_seen: Instant,
}

/// Bounded table of nodes heard directly (not relayed), keyed by sender.
pub struct NeighborTable {
    entries: HashMap<NodeId, Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        NeighborTable { entries: HashMap::new() }
    }

    /// Record a direct Hello, or a non-relayed Data message, as evidence
    /// a node is in range. Relayed Data frames do *not* refresh the
    /// table: their RSSI reflects the relay, not the original sender, so
    /// recording it would make a multi-hop-only node look directly
    /// reachable.
    pub fn observe(&mut self, sender: NodeId, nick: String, rssi: i16, now: Instant) {
        self.evict_stale(now);
        if self.entries.len() >= MAX_NEIGHBORS && !self.entries.contains_key(&sender) {
            self.evict_oldest();
        }
        self.entries.insert(sender, Neighbor { nick, last_rssi: rssi, last_seen: now });
    }

    fn evict_stale(&mut self, now: Instant) {
        self.entries.retain(|_, n| now.saturating_duration_since(n.last_seen) < NEIGHBOR_TIMEOUT);
    }

    /// Explicitly evict stale entries, independent of a new observation.
    /// Used by the periodic HELLO emitter, which must report an
    /// up-to-date neighbor count even if nothing has been heard recently.
    pub fn purge_stale(&mut self, now: Instant) {
        self.evict_stale(now);
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.entries.iter().min_by_key(|(_, n)| n.last_seen).map(|(k, _)| *k) {
            self.entries.remove(&oldest);
        }
    }

    pub fn get(&self, sender: &NodeId) -> Option<&Neighbor> {
        self.entries.get(sender)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All currently-known neighbors, for the `!ls` command.
    pub fn list(&self) -> Vec<(NodeId, Neighbor)> {
        self.entries.iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_then_get_round_trip() {
        let mut t = NeighborTable::new();
        let now = Instant::now();
        let id = NodeId::from_bytes([1; 6]);
        t.observe(id, "alice".into(), -80, now);
        let n = t.get(&id).unwrap();
        assert_eq!(n.nick, "alice");
        assert_eq!(n.last_rssi, -80);
    }

    #[test]
    fn stale_entries_are_evicted() {
        let mut t = NeighborTable::new();
        let t0 = Instant::now();
        let id = NodeId::from_bytes([1; 6]);
        t.observe(id, "alice".into(), -80, t0);
        let later = t0 + NEIGHBOR_TIMEOUT + Duration::from_secs(1);
        t.observe(NodeId::from_bytes([2; 6]), "bob".into(), -70, later);
        assert!(t.get(&id).is_none());
    }

    #[test]
    fn table_is_bounded() {
        let mut t = NeighborTable::new();
        let now = Instant::now();
        for i in 0..(MAX_NEIGHBORS + 10) {
            let mut bytes = [0u8; 6];
            bytes[0] = i as u8;
            bytes[1] = (i >> 8) as u8;
            t.observe(NodeId::from_bytes(bytes), format!("n{i}"), -60, now);
        }
        assert!(t.len() <= MAX_NEIGHBORS);
    }
}
