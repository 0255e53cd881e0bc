/*
    manager.rs - Authoritative per-record merge state

    Owns the RecordState of every known record, keeps it in memory and
    persists each change through one LocalStore commit that also writes the
    materialized record and the matching queue change (enqueue or
    acknowledge). Local edits, pulled records and push acknowledgements all
    go through the same write path, serialized by the state lock.
*/

use super::record_state::{RecordState, RemoteSnapshot};
use super::traits::Crdt;
use super::vector_clock::NodeId;
use crate::core_store::model::{
    EntityKind, FieldMap, OperationId, OperationKind, PendingOperation, QueueChange, Record,
    RecordId, ResolutionStrategy, Timestamp,
};
use crate::core_store::store::errors::{StoreError, StoreResult};
use crate::core_store::store::LocalStore;
use crate::metrics::{CONFLICTS_DETECTED, PULL_MERGED};
use metrics::counter;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Internal("Lock poisoned: a thread panicked while holding the merge state".to_string())
}

/// Result of one committed (or skipped) change
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Materialized record after the change, as stored
    pub record: Record,
    /// False when the change was already known and nothing was written
    pub changed: bool,
    /// The change turned a clean record into a conflicted one
    pub newly_conflicted: bool,
    /// Operation enqueued with the change, if any
    pub enqueued: Option<OperationId>,
}

/// What a mutation produced before it is committed
enum Staged {
    /// Already known; nothing to write
    Unchanged,
    /// State changed, nothing to send (remote merge)
    Merged,
    /// State changed and the remote must be told
    Intent(OperationKind, Value),
}

pub struct CrdtStateManager {
    store: Arc<LocalStore>,
    node_id: NodeId,
    states: RwLock<HashMap<RecordId, RecordState>>,
}

impl CrdtStateManager {
    pub fn new(store: Arc<LocalStore>, node_id: impl Into<NodeId>) -> Self {
        CrdtStateManager {
            store,
            node_id: node_id.into(),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Load persisted merge state; safe to call repeatedly
    pub fn init(&self) -> StoreResult<usize> {
        let loaded = self.store.load_states()?;
        let mut states = self.states.write().map_err(handle_poison)?;
        states.clear();
        for state in loaded {
            states.insert(state.uuid.clone(), state);
        }
        info!(records = states.len(), node = %self.node_id, "Merge state loaded");
        Ok(states.len())
    }

    /// Snapshot of one record's merge state
    pub fn state(&self, uuid: &RecordId) -> StoreResult<Option<RecordState>> {
        Ok(self.states.read().map_err(handle_poison)?.get(uuid).cloned())
    }

    /// Current merged view, with the local row key and sync flag from the store
    pub fn get_observation(&self, uuid: &RecordId) -> StoreResult<Option<Record>> {
        let Some(state) = self.state(uuid)? else {
            return Ok(None);
        };
        let mut record = state.materialize();
        if let Some(stored) = self.store.get(state.entity, uuid)? {
            record.local_id = stored.local_id;
            record.synced = stored.synced;
        }
        Ok(Some(record))
    }

    /// Records currently flagged for review
    pub fn conflicted(&self) -> StoreResult<Vec<Record>> {
        let states = self.states.read().map_err(handle_poison)?;
        let mut records: Vec<Record> = states
            .values()
            .filter(|s| s.is_conflicted())
            .map(RecordState::materialize)
            .collect();
        records.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(records)
    }

    /// Local field write; creates the record if it does not exist yet
    pub fn update_observation(
        &self,
        entity: EntityKind,
        uuid: &RecordId,
        fields: &FieldMap,
        intent: Option<OperationKind>,
        now: Timestamp,
    ) -> StoreResult<MergeOutcome> {
        let node = self.node_id.clone();
        self.mutate(uuid, Some(entity), now, |state, is_new| {
            if state.is_deleted() && !state.is_conflicted() {
                return Err(StoreError::InvalidInput(format!("record {} is deleted", uuid)));
            }
            let changed = state.edit_fields(&node, fields, now);
            if changed.is_empty() && !is_new {
                return Ok(Staged::Unchanged);
            }
            Ok(match intent {
                Some(kind) => Staged::Intent(kind, json!({ "fields": changed })),
                None => Staged::Merged,
            })
        })
    }

    /// Fold a record received from the remote
    pub fn merge_remote(&self, incoming: RecordState) -> StoreResult<MergeOutcome> {
        let uuid = incoming.uuid.clone();
        let entity = incoming.entity;
        let outcome = self.mutate(&uuid, Some(entity), incoming.timestamp(), |state, is_new| {
            let before = state.clone();
            state.merge(&incoming)?;
            state.mark_acknowledged(incoming.clock());
            if let Some(snapshot) = incoming.remote_snapshot() {
                state.set_remote_snapshot(snapshot.clone());
            }
            if !is_new && *state == before {
                return Ok(Staged::Unchanged);
            }
            Ok(Staged::Merged)
        })?;
        if outcome.changed {
            counter!(PULL_MERGED).increment(1);
        }
        Ok(outcome)
    }

    /// Local tombstone
    pub fn delete_observation(&self, uuid: &RecordId, now: Timestamp) -> StoreResult<MergeOutcome> {
        let node = self.node_id.clone();
        self.mutate(uuid, None, now, |state, _| {
            if !state.delete(&node, now) {
                return Ok(Staged::Unchanged);
            }
            Ok(Staged::Intent(OperationKind::Delete, json!({})))
        })
    }

    /// Append to the media log
    pub fn add_media(&self, uuid: &RecordId, path: &str, now: Timestamp) -> StoreResult<MergeOutcome> {
        let node = self.node_id.clone();
        self.mutate(uuid, None, now, |state, _| {
            if !state.attach_media(&node, path, now) {
                return Ok(Staged::Unchanged);
            }
            Ok(Staged::Intent(OperationKind::MediaAppend, json!({ "path": path })))
        })
    }

    /// Hide an attached media path
    pub fn detach_media(&self, uuid: &RecordId, path: &str, now: Timestamp) -> StoreResult<MergeOutcome> {
        let node = self.node_id.clone();
        self.mutate(uuid, None, now, |state, _| {
            if !state.detach_media(&node, path, now) {
                return Ok(Staged::Unchanged);
            }
            Ok(Staged::Intent(
                OperationKind::Update,
                json!({ "fields": [], "detached": path }),
            ))
        })
    }

    /// Settle a flagged conflict with a dominating local write
    pub fn resolve(
        &self,
        uuid: &RecordId,
        strategy: ResolutionStrategy,
        merged: Option<&FieldMap>,
        now: Timestamp,
    ) -> StoreResult<MergeOutcome> {
        let node = self.node_id.clone();
        self.mutate(uuid, None, now, |state, _| {
            let deleted = state.resolve(&node, strategy, merged, now)?;
            if deleted {
                Ok(Staged::Intent(OperationKind::Delete, json!({})))
            } else {
                let names: Vec<String> = state.field_values().into_keys().collect();
                Ok(Staged::Intent(
                    OperationKind::Update,
                    json!({ "fields": names, "resolution": strategy }),
                ))
            }
        })
    }

    /// Fold a push acknowledgement in and drop the acknowledged operation
    ///
    /// `sent` is the state the pushed body was built from.
    pub fn acknowledge(
        &self,
        uuid: &RecordId,
        op_id: &OperationId,
        server_id: Option<String>,
        sent: &RecordState,
    ) -> StoreResult<MergeOutcome> {
        let uuid = uuid.clone();
        let op_id = op_id.clone();
        let mut states = self.states.write().map_err(handle_poison)?;
        let mut state = states
            .get(&uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("record {}", uuid)))?;

        match (&state.server_id, server_id) {
            (None, Some(assigned)) => {
                debug!(uuid = %uuid, server_id = %assigned, "Server id assigned");
                state.server_id = Some(assigned);
            }
            (Some(existing), Some(assigned)) if *existing != assigned => {
                tracing::warn!(
                    uuid = %uuid,
                    existing = %existing,
                    returned = %assigned,
                    "Remote returned a different server id; keeping the first"
                );
            }
            _ => {}
        }
        state.mark_acknowledged(sent.clock());
        state.set_remote_snapshot(RemoteSnapshot::of(sent));

        let record = state.materialize();
        let stored = self
            .store
            .commit_merge(&state, &record, &QueueChange::Acknowledge(op_id))?;
        states.insert(uuid, state);
        Ok(MergeOutcome {
            record: stored,
            changed: true,
            newly_conflicted: false,
            enqueued: None,
        })
    }

    /// Rewrite the stored record after its queue changed outside a merge
    pub fn refresh(&self, uuid: &RecordId) -> StoreResult<Record> {
        let states = self.states.write().map_err(handle_poison)?;
        let state = states
            .get(uuid)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", uuid)))?;
        self.store
            .commit_merge(state, &state.materialize(), &QueueChange::None)
    }

    /// Shared write path
    ///
    /// `apply` mutates a working copy of the state; the store commit and
    /// the cache update happen only if it reports a change.
    fn mutate<F>(
        &self,
        uuid: &RecordId,
        entity: Option<EntityKind>,
        now: Timestamp,
        apply: F,
    ) -> StoreResult<MergeOutcome>
    where
        F: FnOnce(&mut RecordState, bool) -> StoreResult<Staged>,
    {
        let mut states = self.states.write().map_err(handle_poison)?;
        let existing = states.get(uuid).cloned();
        let is_new = existing.is_none();
        let mut state = match (existing, entity) {
            (Some(state), _) => state,
            (None, Some(entity)) => RecordState::new(uuid.clone(), entity),
            (None, None) => return Err(StoreError::NotFound(format!("record {}", uuid))),
        };
        let was_conflicted = !is_new && state.is_conflicted();

        let change = match apply(&mut state, is_new)? {
            Staged::Unchanged => {
                let mut record = state.materialize();
                if let Some(stored) = self.store.get(state.entity, uuid)? {
                    record.local_id = stored.local_id;
                    record.synced = stored.synced;
                }
                return Ok(MergeOutcome {
                    record,
                    changed: false,
                    newly_conflicted: false,
                    enqueued: None,
                });
            }
            Staged::Merged => QueueChange::None,
            Staged::Intent(kind, payload) => QueueChange::Enqueue(PendingOperation::new(
                uuid.clone(),
                state.entity,
                kind,
                payload,
                now,
            )),
        };
        let enqueued = match &change {
            QueueChange::Enqueue(op) => Some(op.id.clone()),
            _ => None,
        };

        let record = state.materialize();
        let stored = self.store.commit_merge(&state, &record, &change)?;
        let newly_conflicted = stored.conflict && !was_conflicted;
        if newly_conflicted {
            counter!(CONFLICTS_DETECTED).increment(1);
            info!(uuid = %uuid, entity = %state.entity, "Record flagged as conflicted");
        }
        debug!(uuid = %uuid, enqueued = enqueued.is_some(), "Merge state committed");

        states.insert(uuid.clone(), state);
        Ok(MergeOutcome {
            record: stored,
            changed: true,
            newly_conflicted,
            enqueued,
        })
    }
}
