/*
    record_state.rs - Merge state of one record

    Composition:
    - One FieldRegister per scalar field
    - A FieldRegister<bool> tombstone
    - A grow-only MediaLog plus per-path hidden flags
    - The record clock: join of every version clock held, ticked by each
      local mutation so a new local write dominates everything seen so far

    Conflicts:
    - Field conflict: a field register holds concurrent versions with
      different values
    - Delete conflict: the shown tombstone is concurrent with a field write

    Both are derived from the versions, never stored as flags, so the merged
    result is identical whatever order replicas are folded in.
*/

use super::field_register::{FieldRegister, Version};
use super::media_log::{MediaEntry, MediaLog};
use super::traits::Crdt;
use super::vector_clock::{ClockOrdering, VectorClock, SERVER_ORIGIN};
use crate::core_store::model::{
    deep_merge, ConflictData, EntityKind, FieldMap, Record, RecordId, ResolutionStrategy, Timestamp,
};
use crate::core_store::store::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Single replicated change to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordOperation {
    SetField { name: String, version: Version<Value> },
    SetDeleted(Version<bool>),
    AppendMedia(MediaEntry),
    SetMediaHidden { path: String, version: Version<bool> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordState {
    pub uuid: RecordId,
    pub entity: EntityKind,
    /// Assigned once by the first acknowledged create
    pub server_id: Option<String>,
    fields: BTreeMap<String, FieldRegister<Value>>,
    deleted: FieldRegister<bool>,
    media: MediaLog,
    #[serde(default)]
    hidden_media: BTreeMap<String, FieldRegister<bool>>,
    clock: VectorClock,
    /// Join of clocks the remote is known to hold
    #[serde(default)]
    acked_clock: VectorClock,
    /// Plain values the remote last confirmed holding; local bookkeeping, never merged
    #[serde(default)]
    remote: Option<RemoteSnapshot>,
    timestamp: Timestamp,
}

/// Values of a record as a server without merge state holds them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub fields: FieldMap,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteSnapshot {
    /// What a push of `state` leaves on the server
    pub fn of(state: &RecordState) -> Self {
        RemoteSnapshot {
            fields: state.field_values(),
            media: state.media_paths(),
            deleted: state.is_deleted(),
        }
    }
}

impl RecordState {
    pub fn new(uuid: RecordId, entity: EntityKind) -> Self {
        RecordState {
            uuid,
            entity,
            server_id: None,
            fields: BTreeMap::new(),
            deleted: FieldRegister::new(),
            media: MediaLog::new(),
            hidden_media: BTreeMap::new(),
            clock: VectorClock::new(),
            acked_clock: VectorClock::new(),
            remote: None,
            timestamp: Timestamp(0),
        }
    }

    /// State for a plain record from a server that does not keep merge state
    ///
    /// Values are stamped with `base` joined with the `server` origin at
    /// `counter`. Callers pass the clock the server is known to have seen, so
    /// a server value supersedes local writes it already received.
    ///
    /// Only what differs from `known`, the copy the server last confirmed,
    /// gets a version. A value the server merely echoes back from this
    /// device's own push therefore never races a later local edit.
    pub fn synthesized(
        uuid: RecordId,
        entity: EntityKind,
        server_id: Option<String>,
        incoming: &RemoteSnapshot,
        known: Option<&RemoteSnapshot>,
        base: &VectorClock,
        counter: u64,
    ) -> Self {
        let mut clock = base.clone();
        clock.set(SERVER_ORIGIN, clock.get(SERVER_ORIGIN).max(counter.max(1)));

        let mut state = RecordState::new(uuid, entity);
        state.server_id = server_id;
        let was_deleted = known.map_or(false, |k| k.deleted);
        if incoming.deleted != was_deleted {
            state
                .deleted
                .insert(Version::new(incoming.deleted, clock.clone(), SERVER_ORIGIN));
        }
        if !incoming.deleted {
            for (name, value) in &incoming.fields {
                if known.and_then(|k| k.fields.get(name)) == Some(value) {
                    continue;
                }
                state
                    .fields
                    .entry(name.clone())
                    .or_default()
                    .insert(Version::new(value.clone(), clock.clone(), SERVER_ORIGIN));
            }
        }
        for path in &incoming.media {
            if known.map_or(false, |k| k.media.contains(path)) {
                continue;
            }
            state.media.append(MediaEntry {
                path: path.clone(),
                origin: SERVER_ORIGIN.to_string(),
                clock: clock.clone(),
            });
        }
        state.remote = Some(incoming.clone());
        state.acked_clock = clock.clone();
        state.clock = clock;
        state
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn acked_clock(&self) -> &VectorClock {
        &self.acked_clock
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Record that the remote now holds everything up to `clock`
    pub fn mark_acknowledged(&mut self, clock: &VectorClock) {
        self.acked_clock.merge(clock);
    }

    pub fn remote_snapshot(&self) -> Option<&RemoteSnapshot> {
        self.remote.as_ref()
    }

    pub fn set_remote_snapshot(&mut self, snapshot: RemoteSnapshot) {
        self.remote = Some(snapshot);
    }

    fn tick(&mut self, node: &str, now: Timestamp) -> VectorClock {
        self.clock.increment(node);
        self.timestamp = self.timestamp.max(now);
        self.clock.clone()
    }

    /// Local write of field values; returns the names that actually changed
    pub fn edit_fields(&mut self, node: &str, fields: &FieldMap, now: Timestamp) -> Vec<String> {
        let changed: Vec<String> = fields
            .iter()
            .filter(|(name, value)| {
                self.fields.get(*name).and_then(FieldRegister::get) != Some(*value)
            })
            .map(|(name, _)| name.clone())
            .collect();
        if changed.is_empty() {
            return changed;
        }

        let clock = self.tick(node, now);
        for name in &changed {
            let value = fields.get(name).cloned().unwrap_or(Value::Null);
            self.fields
                .entry(name.clone())
                .or_default()
                .insert(Version::new(value, clock.clone(), node));
        }
        changed
    }

    /// Local tombstone; returns false if the record is already settled as deleted
    pub fn delete(&mut self, node: &str, now: Timestamp) -> bool {
        if self.is_deleted() && !self.deleted.is_conflicted() {
            return false;
        }
        let clock = self.tick(node, now);
        self.deleted.insert(Version::new(true, clock, node));
        true
    }

    /// Attach a media path, re-showing it if it was hidden
    pub fn attach_media(&mut self, node: &str, path: &str, now: Timestamp) -> bool {
        let present = self.media.contains(path);
        let hidden = self.is_media_hidden(path);
        if present && !hidden {
            return false;
        }

        let clock = self.tick(node, now);
        if !present {
            self.media.append(MediaEntry {
                path: path.to_string(),
                origin: node.to_string(),
                clock: clock.clone(),
            });
        }
        if hidden {
            self.hidden_media
                .entry(path.to_string())
                .or_default()
                .insert(Version::new(false, clock, node));
        }
        true
    }

    /// Hide a media path; the log entry itself is kept
    pub fn detach_media(&mut self, node: &str, path: &str, now: Timestamp) -> bool {
        if !self.media.contains(path) || self.is_media_hidden(path) {
            return false;
        }
        let clock = self.tick(node, now);
        self.hidden_media
            .entry(path.to_string())
            .or_default()
            .insert(Version::new(true, clock, node));
        true
    }

    fn is_media_hidden(&self, path: &str) -> bool {
        self.hidden_media
            .get(path)
            .and_then(FieldRegister::get)
            .copied()
            .unwrap_or(false)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.get() == Some(&true)
    }

    fn tombstone(&self) -> Option<&Version<bool>> {
        self.deleted.winner().filter(|v| v.value)
    }

    /// Current clock-ordered versions of one field
    pub fn field_versions(&self, name: &str) -> &[Version<Value>] {
        self.fields.get(name).map(FieldRegister::versions).unwrap_or(&[])
    }

    /// Visible media paths in attachment order
    pub fn media_paths(&self) -> Vec<String> {
        self.media
            .paths()
            .into_iter()
            .filter(|p| !self.is_media_hidden(p))
            .collect()
    }

    /// Current field values
    pub fn field_values(&self) -> FieldMap {
        self.fields
            .iter()
            .filter_map(|(name, reg)| reg.get().map(|v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn conflict_data(&self) -> Option<ConflictData> {
        let mut data = ConflictData::default();

        for (name, reg) in &self.fields {
            let losers: Vec<Value> = reg.losers().into_iter().map(|v| v.value.clone()).collect();
            if !losers.is_empty() {
                data.fields.insert(name.clone(), losers);
            }
        }

        if let Some(tombstone) = self.tombstone() {
            for (name, reg) in &self.fields {
                let racing: Vec<&Version<Value>> = reg
                    .versions()
                    .iter()
                    .filter(|v| v.clock.compare(&tombstone.clock) == ClockOrdering::Concurrent)
                    .collect();
                if racing.is_empty() {
                    continue;
                }
                data.delete_conflict = true;
                let entry = data.fields.entry(name.clone()).or_default();
                for version in racing {
                    if !entry.contains(&version.value) {
                        entry.push(version.value.clone());
                    }
                }
            }
        }
        if self.deleted.is_conflicted() {
            data.delete_conflict = true;
        }

        if data.is_empty() {
            None
        } else {
            Some(data)
        }
    }

    pub fn is_conflicted(&self) -> bool {
        self.conflict_data().is_some()
    }

    /// Settle every conflict with one local write that dominates all versions
    ///
    /// Returns whether the record ends up deleted.
    pub fn resolve(
        &mut self,
        node: &str,
        strategy: ResolutionStrategy,
        merged: Option<&FieldMap>,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let data = self
            .conflict_data()
            .ok_or_else(|| StoreError::InvalidInput(format!("record {} has no conflict", self.uuid)))?;
        let merged = match (strategy, merged) {
            (ResolutionStrategy::Merge, None) => {
                return Err(StoreError::InvalidInput(
                    "merge resolution requires merged fields".to_string(),
                ))
            }
            (_, merged) => merged,
        };

        let mut chosen = FieldMap::new();
        for name in data.fields.keys() {
            let Some(reg) = self.fields.get(name) else {
                continue;
            };
            let Some(winner) = reg.winner() else {
                continue;
            };
            let value = match strategy {
                ResolutionStrategy::Local => reg.version_from(node).unwrap_or(winner).value.clone(),
                ResolutionStrategy::Remote => {
                    reg.version_not_from(node).unwrap_or(winner).value.clone()
                }
                ResolutionStrategy::Merge => match merged.and_then(|m| m.get(name)) {
                    Some(supplied) => deep_merge(&winner.value, supplied),
                    None => winner.value.clone(),
                },
            };
            chosen.insert(name.clone(), value);
        }
        if let Some(merged) = merged {
            for (name, supplied) in merged {
                if chosen.contains_key(name) {
                    continue;
                }
                let value = match self.fields.get(name).and_then(FieldRegister::get) {
                    Some(current) => deep_merge(current, supplied),
                    None => supplied.clone(),
                };
                chosen.insert(name.clone(), value);
            }
        }

        let was_deleted = self.is_deleted();
        let keep_deleted = if data.delete_conflict {
            match strategy {
                ResolutionStrategy::Local => {
                    self.deleted.version_from(node).map(|v| v.value).unwrap_or(false)
                }
                ResolutionStrategy::Remote => {
                    self.deleted.version_not_from(node).map(|v| v.value).unwrap_or(false)
                }
                ResolutionStrategy::Merge => false,
            }
        } else {
            was_deleted
        };

        let clock = self.tick(node, now);
        for (name, value) in chosen {
            self.fields
                .entry(name)
                .or_default()
                .insert(Version::new(value, clock.clone(), node));
        }
        if data.delete_conflict || keep_deleted != was_deleted {
            self.deleted.insert(Version::new(keep_deleted, clock, node));
        }
        Ok(keep_deleted)
    }

    /// Flattened view; `synced` is decided by the store from the queue
    pub fn materialize(&self) -> Record {
        let conflict_data = self.conflict_data();
        Record {
            local_id: None,
            uuid: self.uuid.clone(),
            entity: self.entity,
            server_id: self.server_id.clone(),
            fields: self.field_values(),
            media: self.media_paths(),
            deleted: self.is_deleted(),
            synced: false,
            conflict: conflict_data.is_some(),
            conflict_data,
            timestamp: self.timestamp,
        }
    }
}

impl Crdt for RecordState {
    type Operation = RecordOperation;
    type Value = Record;

    fn apply(&mut self, op: Self::Operation) -> StoreResult<()> {
        match op {
            RecordOperation::SetField { name, version } => {
                self.clock.merge(&version.clock);
                self.fields.entry(name).or_default().insert(version);
            }
            RecordOperation::SetDeleted(version) => {
                self.clock.merge(&version.clock);
                self.deleted.insert(version);
            }
            RecordOperation::AppendMedia(entry) => {
                self.clock.merge(&entry.clock);
                self.media.append(entry);
            }
            RecordOperation::SetMediaHidden { path, version } => {
                self.clock.merge(&version.clock);
                self.hidden_media.entry(path).or_default().insert(version);
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: &Self) -> StoreResult<()> {
        if self.uuid != other.uuid {
            return Err(StoreError::InvalidInput(format!(
                "cannot merge record {} into {}",
                other.uuid, self.uuid
            )));
        }
        if self.server_id.is_none() {
            self.server_id = other.server_id.clone();
        }
        for (name, reg) in &other.fields {
            self.fields.entry(name.clone()).or_default().merge(reg)?;
        }
        self.deleted.merge(&other.deleted)?;
        self.media.merge(&other.media)?;
        for (path, reg) in &other.hidden_media {
            self.hidden_media.entry(path.clone()).or_default().merge(reg)?;
        }
        self.clock.merge(&other.clock);
        self.acked_clock.merge(&other.acked_clock);
        self.timestamp = self.timestamp.max(other.timestamp);
        Ok(())
    }

    fn value(&self) -> Self::Value {
        self.materialize()
    }

    fn vector_clock(&self) -> VectorClock {
        self.clock.clone()
    }
}
