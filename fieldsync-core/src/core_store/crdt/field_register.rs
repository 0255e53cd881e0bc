/*
    field_register.rs - Clock-ordered register for a single record field

    Holds every version of the field that is not causally superseded by
    another. A write whose clock is after an existing version replaces it;
    concurrent writes are all retained.

    - One surviving version: the field is settled
    - Several surviving versions with different values: the field is in
      conflict; the version with the highest tiebreak key is shown and the
      rest are kept as conflict data

    The tiebreak key is (sum of clock counters, origin, value) and never
    involves wall-clock time, so every replica picks the same winner.

    Use cases:
    - Scalar observation fields (moisture, height, notes)
    - The record tombstone flag
    - Per-path media hidden flags
*/

use super::traits::Crdt;
use super::vector_clock::{ClockOrdering, NodeId, VectorClock};
use crate::core_store::store::errors::StoreResult;
use serde::{Deserialize, Serialize};

/// One write to a register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version<T> {
    pub value: T,
    pub clock: VectorClock,
    /// Origin that produced the write
    pub origin: NodeId,
}

impl<T: Serialize> Version<T> {
    pub fn new(value: T, clock: VectorClock, origin: impl Into<NodeId>) -> Self {
        Version {
            value,
            clock,
            origin: origin.into(),
        }
    }

    fn tiebreak_key(&self) -> (u64, &str, String, String) {
        (
            self.clock.total(),
            self.origin.as_str(),
            serde_json::to_string(&self.value).unwrap_or_default(),
            serde_json::to_string(&self.clock).unwrap_or_default(),
        )
    }
}

/// Multi-version register ordered by vector clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRegister<T> {
    /// Surviving versions, winner first
    versions: Vec<Version<T>>,
}

impl<T> Default for FieldRegister<T> {
    fn default() -> Self {
        FieldRegister {
            versions: Vec::new(),
        }
    }
}

impl<T> FieldRegister<T>
where
    T: Clone + PartialEq + Serialize,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: Version<T>) -> Self {
        let mut register = Self::new();
        register.insert(version);
        register
    }

    /// Fold one version in; returns false if it was already known or superseded
    pub fn insert(&mut self, incoming: Version<T>) -> bool {
        if self
            .versions
            .iter()
            .any(|existing| existing.clock.dominates(&incoming.clock))
        {
            return false;
        }

        self.versions
            .retain(|existing| existing.clock.compare(&incoming.clock) != ClockOrdering::Before);
        self.versions.push(incoming);
        self.versions.sort_by(|a, b| b.tiebreak_key().cmp(&a.tiebreak_key()));
        true
    }

    /// Version currently shown
    pub fn winner(&self) -> Option<&Version<T>> {
        self.versions.first()
    }

    pub fn get(&self) -> Option<&T> {
        self.winner().map(|v| &v.value)
    }

    pub fn versions(&self) -> &[Version<T>] {
        &self.versions
    }

    /// Versions that lost the tiebreak and carry a different value than the winner
    pub fn losers(&self) -> Vec<&Version<T>> {
        match self.winner() {
            Some(winner) => self
                .versions
                .iter()
                .skip(1)
                .filter(|v| v.value != winner.value)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Concurrent versions disagree on the value
    pub fn is_conflicted(&self) -> bool {
        !self.losers().is_empty()
    }

    /// Version written by the given origin, if it survived
    pub fn version_from(&self, origin: &str) -> Option<&Version<T>> {
        self.versions.iter().find(|v| v.origin == origin)
    }

    /// Best surviving version not written by the given origin
    pub fn version_not_from(&self, origin: &str) -> Option<&Version<T>> {
        self.versions.iter().find(|v| v.origin != origin)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl<T> Crdt for FieldRegister<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync,
{
    type Operation = Version<T>;
    type Value = Option<T>;

    fn apply(&mut self, op: Self::Operation) -> StoreResult<()> {
        self.insert(op);
        Ok(())
    }

    fn merge(&mut self, other: &Self) -> StoreResult<()> {
        for version in &other.versions {
            self.insert(version.clone());
        }
        Ok(())
    }

    fn value(&self) -> Self::Value {
        self.get().cloned()
    }

    fn vector_clock(&self) -> VectorClock {
        let mut clock = VectorClock::new();
        for version in &self.versions {
            clock.merge(&version.clock);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn version(value: Value, origin: &str, entries: &[(&str, u64)]) -> Version<Value> {
        let mut clock = VectorClock::new();
        for (node, counter) in entries {
            clock.set(node, *counter);
        }
        Version::new(value, clock, origin)
    }

    #[test]
    fn test_later_write_replaces_earlier() {
        let mut reg = FieldRegister::new();
        reg.insert(version(json!(10), "tablet-a", &[("tablet-a", 1)]));
        assert!(reg.insert(version(json!(11), "tablet-a", &[("tablet-a", 2)])));

        assert_eq!(reg.get(), Some(&json!(11)));
        assert_eq!(reg.versions().len(), 1);
        assert!(!reg.is_conflicted());
    }

    #[test]
    fn test_stale_write_ignored() {
        let mut reg = FieldRegister::new();
        reg.insert(version(json!(11), "tablet-a", &[("tablet-a", 2)]));
        assert!(!reg.insert(version(json!(10), "tablet-a", &[("tablet-a", 1)])));
        assert_eq!(reg.get(), Some(&json!(11)));
    }

    #[test]
    fn test_duplicate_write_is_noop() {
        let v = version(json!(12), "tablet-a", &[("tablet-a", 1)]);
        let mut reg = FieldRegister::with_version(v.clone());
        assert!(!reg.insert(v));
        assert_eq!(reg.versions().len(), 1);
    }

    #[test]
    fn test_concurrent_writes_conflict_with_stable_winner() {
        let a = version(json!(12), "tablet-a", &[("tablet-a", 1)]);
        let b = version(json!(14), "tablet-b", &[("tablet-b", 1)]);

        let mut ab = FieldRegister::new();
        ab.insert(a.clone());
        ab.insert(b.clone());

        let mut ba = FieldRegister::new();
        ba.insert(b);
        ba.insert(a);

        assert_eq!(ab, ba);
        assert!(ab.is_conflicted());
        // equal clock totals, origin breaks the tie
        assert_eq!(ab.get(), Some(&json!(14)));
        assert_eq!(ab.losers()[0].value, json!(12));
    }

    #[test]
    fn test_concurrent_equal_values_do_not_conflict() {
        let mut reg = FieldRegister::new();
        reg.insert(version(json!("dry"), "tablet-a", &[("tablet-a", 1)]));
        reg.insert(version(json!("dry"), "server", &[("server", 9)]));
        assert_eq!(reg.versions().len(), 2);
        assert!(!reg.is_conflicted());
    }

    #[test]
    fn test_dominating_write_settles_conflict() {
        let mut reg = FieldRegister::new();
        reg.insert(version(json!(12), "tablet-a", &[("tablet-a", 1)]));
        reg.insert(version(json!(14), "tablet-b", &[("tablet-b", 1)]));
        assert!(reg.is_conflicted());

        reg.insert(version(json!(13), "tablet-a", &[("tablet-a", 2), ("tablet-b", 1)]));
        assert!(!reg.is_conflicted());
        assert_eq!(reg.get(), Some(&json!(13)));
        assert_eq!(reg.vector_clock().get("tablet-b"), 1);
    }

    #[test]
    fn test_origin_lookup() {
        let mut reg = FieldRegister::new();
        reg.insert(version(json!(12), "tablet-a", &[("tablet-a", 1)]));
        reg.insert(version(json!(14), "tablet-b", &[("tablet-b", 1)]));

        assert_eq!(reg.version_from("tablet-a").map(|v| &v.value), Some(&json!(12)));
        assert_eq!(reg.version_not_from("tablet-a").map(|v| &v.value), Some(&json!(14)));
    }
}
