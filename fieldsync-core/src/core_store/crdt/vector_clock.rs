/*
    vector_clock.rs - Per-origin counters for causal ordering of record versions

    Every device (and the reserved `server` origin) owns one counter.
    Two versions of the same field are compared by their clocks:
    - Before / After: one causally supersedes the other
    - Equal: the same version seen twice
    - Concurrent: neither saw the other, a conflict candidate

    Wall-clock time never participates in ordering.
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Origin (device) identifier for vector clock entries
pub type NodeId = String;

/// Origin used for versions synthesized from plain server records
pub const SERVER_ORIGIN: &str = "server";

/// Causal relation between two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Vector clock for tracking causal order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    /// Map from origin ID to logical counter
    clock: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock
    pub fn new() -> Self {
        VectorClock {
            clock: BTreeMap::new(),
        }
    }

    /// Clock with a single entry
    pub fn single(node_id: &str, counter: u64) -> Self {
        let mut clock = Self::new();
        clock.set(node_id, counter);
        clock
    }

    /// Increment the counter for a given origin
    pub fn increment(&mut self, node_id: &str) -> u64 {
        let counter = self.clock.entry(node_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Get the counter for an origin
    pub fn get(&self, node_id: &str) -> u64 {
        self.clock.get(node_id).copied().unwrap_or(0)
    }

    /// Set the counter for an origin
    pub fn set(&mut self, node_id: &str, counter: u64) {
        if counter == 0 {
            self.clock.remove(node_id);
        } else {
            self.clock.insert(node_id.to_string(), counter);
        }
    }

    /// Merge two vector clocks (take maximum of each entry)
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, &counter) in &other.clock {
            let current = self.clock.entry(node_id.clone()).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    /// Pointwise maximum of two clocks
    pub fn joined(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// True if every entry in self <= other and at least one is strictly less
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Check if two clocks are concurrent (neither happened before the other)
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// True if self is after or equal to other
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::After | ClockOrdering::Equal)
    }

    /// Classify the causal relation of self relative to other
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for node_id in self.clock.keys().chain(other.clock.keys()) {
            let mine = self.get(node_id);
            let theirs = other.get(node_id);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Compare two vector clocks; `None` means concurrent
    pub fn partial_cmp(&self, other: &VectorClock) -> Option<Ordering> {
        match self.compare(other) {
            ClockOrdering::Equal => Some(Ordering::Equal),
            ClockOrdering::Before => Some(Ordering::Less),
            ClockOrdering::After => Some(Ordering::Greater),
            ClockOrdering::Concurrent => None,
        }
    }

    /// Sum of all counters, used as the first deterministic tiebreak key
    pub fn total(&self) -> u64 {
        self.clock.values().sum()
    }

    /// Get all origin IDs in this clock
    pub fn node_ids(&self) -> Vec<String> {
        self.clock.keys().cloned().collect()
    }

    /// Check if clock is empty
    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    /// Get the number of origins tracked
    pub fn len(&self) -> usize {
        self.clock.len()
    }
}

impl Default for VectorClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_clock_creation() {
        let vc = VectorClock::new();
        assert!(vc.is_empty());
        assert_eq!(vc.len(), 0);
        assert_eq!(vc.total(), 0);
    }

    #[test]
    fn test_increment() {
        let mut vc = VectorClock::new();
        assert_eq!(vc.increment("tablet-a"), 1);
        assert_eq!(vc.increment("tablet-a"), 2);
        assert_eq!(vc.increment("tablet-b"), 1);
        assert_eq!(vc.get("tablet-a"), 2);
        assert_eq!(vc.get("missing"), 0);
    }

    #[test]
    fn test_before_and_after() {
        let mut a = VectorClock::new();
        a.increment("tablet-a");

        let mut b = a.clone();
        b.increment("tablet-b");

        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
        assert!(a.happened_before(&b));
        assert!(b.dominates(&a));
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
    }

    #[test]
    fn test_concurrent() {
        let a = VectorClock::single("tablet-a", 1);
        let b = VectorClock::single("tablet-b", 1);

        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert!(a.is_concurrent(&b));
        assert!(!a.dominates(&b));
        assert_eq!(a.partial_cmp(&b), None);
    }

    #[test]
    fn test_equal_ignores_zero_entries() {
        let mut a = VectorClock::single("tablet-a", 3);
        a.set("tablet-b", 0);
        let b = VectorClock::single("tablet-a", 3);

        assert_eq!(a, b);
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
        assert!(!a.is_concurrent(&b));
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut a = VectorClock::single("tablet-a", 4);
        a.set("server", 1);
        let mut b = VectorClock::single("tablet-b", 2);
        b.set("server", 7);

        a.merge(&b);
        assert_eq!(a.get("tablet-a"), 4);
        assert_eq!(a.get("tablet-b"), 2);
        assert_eq!(a.get("server"), 7);
        assert!(a.dominates(&b));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut vc = VectorClock::single("tablet-a", 2);
        vc.set("server", 5);
        let json = serde_json::to_string(&vc).unwrap();
        assert_eq!(json, r#"{"server":5,"tablet-a":2}"#);

        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vc);
    }
}
