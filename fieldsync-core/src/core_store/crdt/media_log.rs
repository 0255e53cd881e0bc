/*
    media_log.rs - Grow-only log of media attached to a record

    Entries are keyed by path and only ever added; merge is set union.
    When two replicas attached the same path, the entry with the smaller
    (clock total, origin) is kept so the merged log is identical regardless
    of merge order. Removal is not a log operation; see the hidden-media
    registers in record_state.rs.
*/

use super::traits::Crdt;
use super::vector_clock::{NodeId, VectorClock};
use crate::core_store::store::errors::StoreResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One attached media item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub path: String,
    pub origin: NodeId,
    pub clock: VectorClock,
}

impl MediaEntry {
    fn order_key(&self) -> (u64, &str, &str) {
        (self.clock.total(), self.origin.as_str(), self.path.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLog {
    entries: BTreeMap<String, MediaEntry>,
}

impl MediaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; returns true if the path was not present before
    pub fn append(&mut self, entry: MediaEntry) -> bool {
        match self.entries.get(&entry.path) {
            None => {
                self.entries.insert(entry.path.clone(), entry);
                true
            }
            Some(existing) => {
                if entry.order_key() < existing.order_key() {
                    self.entries.insert(entry.path.clone(), entry);
                }
                false
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Paths in attachment order
    pub fn paths(&self) -> Vec<String> {
        let mut entries: Vec<&MediaEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        entries.into_iter().map(|e| e.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Crdt for MediaLog {
    type Operation = MediaEntry;
    type Value = Vec<String>;

    fn apply(&mut self, op: Self::Operation) -> StoreResult<()> {
        self.append(op);
        Ok(())
    }

    fn merge(&mut self, other: &Self) -> StoreResult<()> {
        for entry in other.entries.values() {
            self.append(entry.clone());
        }
        Ok(())
    }

    fn value(&self) -> Self::Value {
        self.paths()
    }

    fn vector_clock(&self) -> VectorClock {
        let mut clock = VectorClock::new();
        for entry in self.entries.values() {
            clock.merge(&entry.clock);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, origin: &str, counter: u64) -> MediaEntry {
        MediaEntry {
            path: path.to_string(),
            origin: origin.to_string(),
            clock: VectorClock::single(origin, counter),
        }
    }

    #[test]
    fn test_append_and_order() {
        let mut log = MediaLog::new();
        assert!(log.append(entry("photos/2.jpg", "tablet-a", 2)));
        assert!(log.append(entry("photos/1.jpg", "tablet-a", 1)));
        assert_eq!(log.paths(), vec!["photos/1.jpg", "photos/2.jpg"]);
    }

    #[test]
    fn test_merge_is_union() {
        let mut a = MediaLog::new();
        a.append(entry("a.jpg", "tablet-a", 1));
        let mut b = MediaLog::new();
        b.append(entry("b.jpg", "tablet-b", 1));

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 2);
    }

    #[test]
    fn test_same_path_from_two_origins_converges() {
        let mut a = MediaLog::new();
        a.append(entry("shared.jpg", "tablet-b", 1));
        let mut b = MediaLog::new();
        b.append(entry("shared.jpg", "tablet-a", 1));

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 1);
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a = MediaLog::new();
        a.append(entry("a.jpg", "tablet-a", 1));
        let snapshot = a.clone();
        a.merge(&snapshot).unwrap();
        a.merge(&snapshot).unwrap();
        assert_eq!(a, snapshot);
    }
}
