/*
    engine.rs - Sync engine

    Local writes go through the CrdtStateManager, which persists the merge
    state, the materialized record and the queued intent in one commit.
    Cycles then talk to the remote:

    - push: drains the queue in sequence order. Consecutive creates of one
      entity kind are sent as one bulk request. A failed operation blocks
      later operations on the same record for the rest of the cycle; an
      authorization failure halts the cycle with the queue untouched.
    - pull: fetches changes since the per-entity cursor, merges each into
      the local state, then refreshes the reference caches.

    Only one cycle runs at a time; a cycle requested while another is
    running is skipped. Nothing here removes a queued operation except an
    acknowledgement or an explicit operator discard.
*/

use super::clock::{Clock, SystemClock};
use super::errors::{SyncError, SyncResult};
use super::remote::{RemoteApi, RemoteError, WireRecord};
use super::status::{NetworkState, SyncStatus};
use crate::config::SyncConfig;
use crate::core_store::crdt::{CrdtStateManager, MergeOutcome, RecordState, RemoteSnapshot};
use crate::core_store::model::{
    CycleKind, CycleOutcome, EntityKind, FieldMap, OperationId, OperationKind, PendingOperation,
    Record, RecordId, ReferenceKind, ReferenceRecord, ResolutionStrategy, SyncHistoryEntry,
    Timestamp,
};
use crate::core_store::store::{LocalStore, StoreError, StoreStats};
use crate::metrics::{
    Timer, CYCLE_DURATION_MS, PUSH_ACKNOWLEDGED, PUSH_AUTH_HALTED, PUSH_FAILED, QUEUE_PENDING,
};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Counts from one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Operations acknowledged by the remote
    pub pushed: usize,
    /// Operations that failed and stay queued
    pub failed: usize,
    /// Operations not attempted (exhausted, or behind a failure on the same record)
    pub skipped: usize,
    /// Records received from the remote
    pub pulled: usize,
    /// Received records that changed local state
    pub merged: usize,
    /// Records newly flagged as conflicted
    pub conflicts: usize,
    /// Reference rows cached
    pub references: usize,
    pub auth_failed: bool,
    pub last_error: Option<String>,
}

impl SyncReport {
    fn outcome(&self) -> CycleOutcome {
        if self.auth_failed {
            CycleOutcome::AuthFailed
        } else if self.failed > 0 {
            CycleOutcome::Partial
        } else {
            CycleOutcome::Ok
        }
    }
}

/// Whether the push loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Halt,
}

/// Clears the single-flight flag when a cycle ends, however it ends
struct CycleGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.engine.syncing.store(false, Ordering::SeqCst);
        self.engine.status.send_modify(|s| s.is_syncing = false);
    }
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    crdt: Arc<CrdtStateManager>,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    syncing: AtomicBool,
    network: Mutex<NetworkState>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// The engine starts offline; the host reports connectivity through `set_network`
    pub fn new(
        store: Arc<LocalStore>,
        crdt: Arc<CrdtStateManager>,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        SyncEngine {
            store,
            crdt,
            remote,
            clock,
            config,
            status,
            syncing: AtomicBool::new(false),
            network: Mutex::new(NetworkState::Offline),
            background: Mutex::new(None),
        }
    }

    /// Load merge state for this device's node id and build an engine on the system clock
    pub fn bootstrap(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        config: SyncConfig,
    ) -> SyncResult<Arc<Self>> {
        let node_id = store.node_id()?;
        let crdt = Arc::new(CrdtStateManager::new(Arc::clone(&store), node_id));
        crdt.init()?;
        let engine = Arc::new(Self::new(store, crdt, remote, Arc::new(SystemClock), config));
        engine.refresh_status()?;
        Ok(engine)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn crdt(&self) -> &Arc<CrdtStateManager> {
        &self.crdt
    }

    // ===== Local writes =====

    /// Write a record locally and queue it for the remote
    ///
    /// `is_new` queues a create; otherwise the record must already exist and
    /// an update is queued. Media paths on the record are attached.
    pub fn save_observation(self: &Arc<Self>, record: &Record, is_new: bool) -> SyncResult<Record> {
        let existing = self.crdt.state(&record.uuid)?;
        if existing.is_none() && !is_new {
            return Err(SyncError::NotFound(format!("record {}", record.uuid)));
        }
        let kind = if existing.is_none() {
            OperationKind::Create
        } else {
            OperationKind::Update
        };
        let now = self.clock.now();

        let mut outcome =
            self.crdt
                .update_observation(record.entity, &record.uuid, &record.fields, Some(kind), now)?;
        debug!(
            uuid = %record.uuid,
            kind = kind.as_str(),
            queued = outcome.enqueued.is_some(),
            "Record saved"
        );
        for path in &record.media {
            outcome = self.crdt.add_media(&record.uuid, path, now)?;
        }

        self.after_local_write()?;
        Ok(outcome.record)
    }

    pub fn delete_observation(self: &Arc<Self>, uuid: &RecordId) -> SyncResult<Record> {
        let outcome = self.crdt.delete_observation(uuid, self.clock.now())?;
        debug!(uuid = %uuid, queued = outcome.enqueued.is_some(), "Record deleted");
        self.after_local_write()?;
        Ok(outcome.record)
    }

    pub fn attach_media(self: &Arc<Self>, uuid: &RecordId, path: &str) -> SyncResult<Record> {
        let outcome = self.crdt.add_media(uuid, path, self.clock.now())?;
        debug!(uuid = %uuid, path, "Media attached");
        self.after_local_write()?;
        Ok(outcome.record)
    }

    pub fn detach_media(self: &Arc<Self>, uuid: &RecordId, path: &str) -> SyncResult<Record> {
        let outcome = self.crdt.detach_media(uuid, path, self.clock.now())?;
        debug!(uuid = %uuid, path, "Media detached");
        self.after_local_write()?;
        Ok(outcome.record)
    }

    pub fn get_observation(&self, uuid: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self.crdt.get_observation(uuid)?)
    }

    /// Settle a flagged conflict; `merged` is required for the merge strategy
    pub fn resolve_conflict(
        self: &Arc<Self>,
        uuid: &RecordId,
        strategy: ResolutionStrategy,
        merged: Option<&FieldMap>,
    ) -> SyncResult<Record> {
        let state = self
            .crdt
            .state(uuid)?
            .ok_or_else(|| SyncError::NotFound(format!("record {}", uuid)))?;
        if !state.is_conflicted() {
            return Err(SyncError::NoConflict(uuid.to_string()));
        }
        if strategy == ResolutionStrategy::Merge && merged.is_none() {
            return Err(SyncError::MissingMergedFields);
        }

        let outcome = self.crdt.resolve(uuid, strategy, merged, self.clock.now())?;
        info!(uuid = %uuid, strategy = %strategy, "Conflict resolved");
        self.after_local_write()?;
        Ok(outcome.record)
    }

    /// Parse a strategy name as entered by a user
    pub fn parse_strategy(name: &str) -> SyncResult<ResolutionStrategy> {
        name.parse::<ResolutionStrategy>()
            .map_err(|_| SyncError::InvalidStrategy(name.to_string()))
    }

    pub fn conflicts(&self) -> SyncResult<Vec<Record>> {
        Ok(self.crdt.conflicted()?)
    }

    fn after_local_write(self: &Arc<Self>) -> SyncResult<()> {
        self.refresh_status()?;
        self.trigger_push();
        Ok(())
    }

    /// Fire-and-forget push after a local write, when allowed
    fn trigger_push(self: &Arc<Self>) {
        if !self.config.auto_sync || !self.can_sync() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("No async runtime; push deferred to the next cycle");
            return;
        };
        let engine = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = engine.push_changes().await {
                warn!(error = %e, "Push after local write failed");
            }
        });
    }

    // ===== Queue administration =====

    pub fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        Ok(self.store.list_pending()?)
    }

    /// Re-arm an exhausted operation for the next cycle
    pub fn retry_operation(&self, op_id: &OperationId) -> SyncResult<bool> {
        let reset = self.store.reset_retries(op_id)?;
        if reset {
            info!(op = %op_id, "Operation re-armed");
        }
        Ok(reset)
    }

    /// Operator discard of a queued intent
    pub fn discard_operation(&self, op_id: &OperationId) -> SyncResult<Option<PendingOperation>> {
        let Some(op) = self.store.discard(op_id)? else {
            return Ok(None);
        };
        match self.crdt.refresh(&op.target_uuid) {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.refresh_status()?;
        Ok(Some(op))
    }

    pub fn stats(&self) -> SyncResult<StoreStats> {
        Ok(self.store.stats(self.config.max_retries)?)
    }

    pub fn history(&self, limit: usize) -> SyncResult<Vec<SyncHistoryEntry>> {
        Ok(self.store.recent_history(limit)?)
    }

    // ===== Status =====

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Recompute the published status from the store
    pub fn refresh_status(&self) -> SyncResult<SyncStatus> {
        let pending = self.store.pending_count()?;
        let last_sync = self.store.last_sync_time()?;
        let conflicts = self.crdt.conflicted()?.len();
        let online = self.network().is_online();
        gauge!(QUEUE_PENDING).set(pending as f64);

        self.status.send_modify(|s| {
            s.is_online = online;
            s.pending_count = pending;
            s.last_sync_time = last_sync;
            s.conflict_count = conflicts;
        });
        Ok(self.status())
    }

    pub fn network(&self) -> NetworkState {
        *self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a connectivity change; returns the previous state
    pub fn set_network(&self, state: NetworkState) -> NetworkState {
        let previous = {
            let mut current = self.network.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, state)
        };
        if previous != state {
            info!(from = %previous, to = %state, "Network state changed");
        }
        self.status.send_modify(|s| s.is_online = state.is_online());
        previous
    }

    /// Connected, and on an allowed connection type
    pub fn can_sync(&self) -> bool {
        self.network().allows_sync(self.config.wifi_only)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    // ===== Cycles =====

    /// Drain the queue
    pub async fn push_changes(&self) -> SyncResult<Option<SyncReport>> {
        self.run_cycle(CycleKind::Push).await
    }

    /// Fetch and merge remote changes
    pub async fn pull_changes(&self) -> SyncResult<Option<SyncReport>> {
        self.run_cycle(CycleKind::Pull).await
    }

    /// Push then pull; None when skipped (not eligible, or a cycle is already running)
    pub async fn sync_now(&self) -> SyncResult<Option<SyncReport>> {
        self.run_cycle(CycleKind::Full).await
    }

    /// Pull then push, for application start
    pub async fn startup_sync(&self) -> SyncResult<Option<SyncReport>> {
        self.run_cycle(CycleKind::Startup).await
    }

    fn begin_cycle(&self) -> Option<CycleGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.status.send_modify(|s| s.is_syncing = true);
        Some(CycleGuard { engine: self })
    }

    async fn run_cycle(&self, kind: CycleKind) -> SyncResult<Option<SyncReport>> {
        if !self.can_sync() {
            debug!(kind = kind.as_str(), network = %self.network(), "Not eligible for sync; cycle skipped");
            return Ok(None);
        }
        let Some(_guard) = self.begin_cycle() else {
            debug!(kind = kind.as_str(), "Sync already running; cycle skipped");
            return Ok(None);
        };

        let started_at = self.clock.now();
        let timer = Timer::new(CYCLE_DURATION_MS);
        info!(kind = kind.as_str(), "Sync cycle started");

        let mut report = SyncReport::default();
        let result = match kind {
            CycleKind::Push => self.push_into(&mut report).await,
            CycleKind::Pull => self.pull_into(&mut report).await,
            CycleKind::Full => match self.push_into(&mut report).await {
                Ok(()) if !report.auth_failed => self.pull_into(&mut report).await,
                other => other,
            },
            CycleKind::Startup => match self.pull_into(&mut report).await {
                Ok(()) => self.push_into(&mut report).await,
                other => other,
            },
        };
        let elapsed = timer.stop();

        let (outcome, failure) = match result {
            Ok(()) => (report.outcome(), None),
            Err(e) if e.is_auth() => {
                error!(kind = kind.as_str(), error = %e, "Sync cycle halted by authorization failure");
                report.auth_failed = true;
                report.last_error = Some(e.to_string());
                (CycleOutcome::AuthFailed, None)
            }
            Err(e) => {
                error!(kind = kind.as_str(), error = %e, "Sync cycle failed");
                report.last_error = Some(e.to_string());
                (CycleOutcome::Failed, Some(e))
            }
        };

        let finished_at = self.clock.now();
        self.finish_cycle(kind, started_at, finished_at, &report, outcome);
        info!(
            kind = kind.as_str(),
            outcome = %outcome,
            pushed = report.pushed,
            failed = report.failed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            elapsed_ms = elapsed,
            "Sync cycle finished"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(Some(report)),
        }
    }

    /// History, last sync time and status; failures here never mask the cycle result
    fn finish_cycle(
        &self,
        kind: CycleKind,
        started_at: Timestamp,
        finished_at: Timestamp,
        report: &SyncReport,
        outcome: CycleOutcome,
    ) {
        let entry = SyncHistoryEntry {
            id: None,
            kind,
            started_at,
            finished_at,
            pushed: report.pushed as u32,
            pulled: report.pulled as u32,
            outcome,
            error: report.last_error.clone(),
        };
        if let Err(e) = self.store.append_history(&entry) {
            warn!(error = %e, "Failed to record sync history");
        }
        if matches!(outcome, CycleOutcome::Ok | CycleOutcome::Partial) {
            if let Err(e) = self.store.set_last_sync_time(finished_at) {
                warn!(error = %e, "Failed to record last sync time");
            }
        }

        let last_error = report.last_error.clone();
        self.status.send_modify(|s| s.last_error = last_error);
        if let Err(e) = self.refresh_status() {
            warn!(error = %e, "Failed to refresh sync status");
        }
    }

    // ===== Push =====

    async fn push_into(&self, report: &mut SyncReport) -> SyncResult<()> {
        let pending = self.store.list_pending()?;
        let max_retries = self.config.max_retries;
        let batch_size = self.config.push_batch_size.max(1);
        let mut blocked: HashSet<RecordId> = HashSet::new();

        let mut i = 0;
        while i < pending.len() {
            let op = &pending[i];
            if blocked.contains(&op.target_uuid) {
                report.skipped += 1;
                i += 1;
                continue;
            }
            if op.is_exhausted(max_retries) {
                debug!(op = %op.id, target = %op.target_uuid, retries = op.retry_count, "Exhausted operation skipped");
                blocked.insert(op.target_uuid.clone());
                report.skipped += 1;
                i += 1;
                continue;
            }

            let step = if op.kind == OperationKind::Create {
                let mut batch = vec![op];
                let mut j = i + 1;
                while j < pending.len() && batch.len() < batch_size {
                    let next = &pending[j];
                    let joinable = next.kind == OperationKind::Create
                        && next.entity == op.entity
                        && !next.is_exhausted(max_retries)
                        && !blocked.contains(&next.target_uuid)
                        && batch.iter().all(|b| b.target_uuid != next.target_uuid);
                    if !joinable {
                        break;
                    }
                    batch.push(next);
                    j += 1;
                }
                i = j;
                self.push_creates(op.entity, &batch, &mut blocked, report).await?
            } else {
                i += 1;
                self.push_single(op, &mut blocked, report).await?
            };

            if step == Step::Halt {
                break;
            }
        }
        Ok(())
    }

    /// Merge state for a queued operation's target; missing state fails the operation
    fn state_for(
        &self,
        op: &PendingOperation,
        blocked: &mut HashSet<RecordId>,
        report: &mut SyncReport,
    ) -> SyncResult<Option<RecordState>> {
        match self.crdt.state(&op.target_uuid)? {
            Some(state) => Ok(Some(state)),
            None => {
                let err = RemoteError::InvalidResponse(format!(
                    "no merge state for record {}",
                    op.target_uuid
                ));
                self.push_failed(&[op], &err, blocked, report)?;
                Ok(None)
            }
        }
    }

    async fn push_creates(
        &self,
        entity: EntityKind,
        batch: &[&PendingOperation],
        blocked: &mut HashSet<RecordId>,
        report: &mut SyncReport,
    ) -> SyncResult<Step> {
        let mut sent: Vec<(&PendingOperation, RecordState)> = Vec::with_capacity(batch.len());
        let mut bodies = Vec::with_capacity(batch.len());
        for &op in batch {
            if let Some(state) = self.state_for(op, blocked, report)? {
                bodies.push(WireRecord::from_state(&state));
                sent.push((op, state));
            }
        }
        if sent.is_empty() {
            return Ok(Step::Continue);
        }
        for (op, _) in &sent {
            self.store.mark_in_flight(&op.id)?;
        }
        debug!(entity = %entity, count = sent.len(), "Pushing creates");

        match self.remote.create_batch(entity, &bodies).await {
            Ok(created) => {
                for (index, (op, state)) in sent.iter().enumerate() {
                    let server_id = created
                        .iter()
                        .find(|w| w.uuid.as_ref() == Some(&op.target_uuid))
                        .or_else(|| created.get(index).filter(|w| w.uuid.is_none()))
                        .and_then(|w| w.server_id.clone());
                    self.acknowledged(op, server_id, state, report)?;
                }
                Ok(Step::Continue)
            }
            Err(e) => {
                let ops: Vec<&PendingOperation> = sent.iter().map(|(op, _)| *op).collect();
                self.push_failed(&ops, &e, blocked, report)
            }
        }
    }

    async fn push_single(
        &self,
        op: &PendingOperation,
        blocked: &mut HashSet<RecordId>,
        report: &mut SyncReport,
    ) -> SyncResult<Step> {
        let Some(state) = self.state_for(op, blocked, report)? else {
            return Ok(Step::Continue);
        };
        let id = state
            .server_id
            .clone()
            .unwrap_or_else(|| state.uuid.to_string());
        self.store.mark_in_flight(&op.id)?;
        debug!(op = %op.id, target = %op.target_uuid, kind = op.kind.as_str(), id = %id, "Pushing operation");

        let result = match op.kind {
            OperationKind::Delete => self.remote.delete(op.entity, &id).await.map(|()| None),
            _ => self
                .remote
                .update(op.entity, &id, &WireRecord::from_state(&state))
                .await
                .map(|returned| returned.and_then(|w| w.server_id)),
        };

        match result {
            Ok(server_id) => {
                self.acknowledged(op, server_id, &state, report)?;
                Ok(Step::Continue)
            }
            Err(e) => self.push_failed(&[op], &e, blocked, report),
        }
    }

    fn acknowledged(
        &self,
        op: &PendingOperation,
        server_id: Option<String>,
        sent: &RecordState,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let outcome = self
            .crdt
            .acknowledge(&op.target_uuid, &op.id, server_id, sent)?;
        counter!(PUSH_ACKNOWLEDGED).increment(1);
        report.pushed += 1;
        debug!(
            op = %op.id,
            target = %op.target_uuid,
            server_id = outcome.record.server_id.as_deref().unwrap_or("-"),
            synced = outcome.record.synced,
            "Operation acknowledged"
        );
        Ok(())
    }

    /// Return failed operations to the queue; an authorization failure halts the cycle
    fn push_failed(
        &self,
        ops: &[&PendingOperation],
        err: &RemoteError,
        blocked: &mut HashSet<RecordId>,
        report: &mut SyncReport,
    ) -> SyncResult<Step> {
        let message = err.to_string();
        report.last_error = Some(message.clone());

        if err.is_auth() {
            for op in ops {
                self.store.record_failure(&op.id, &message, false)?;
            }
            counter!(PUSH_AUTH_HALTED).increment(1);
            report.auth_failed = true;
            error!(error = %message, "Authorization failed; push halted with queue intact");
            return Ok(Step::Halt);
        }

        for op in ops {
            self.store.record_failure(&op.id, &message, true)?;
            blocked.insert(op.target_uuid.clone());
            warn!(
                op = %op.id,
                target = %op.target_uuid,
                retries = op.retry_count + 1,
                transient = err.is_transient(),
                error = %message,
                "Push failed; operation stays queued"
            );
        }
        counter!(PUSH_FAILED).increment(ops.len() as u64);
        report.failed += ops.len();
        Ok(Step::Continue)
    }

    // ===== Pull =====

    /// The cursor advances to the newest server `updatedAt` seen, never to
    /// the local clock, so client skew cannot hide server changes.
    async fn pull_into(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mut newly_conflicted = Vec::new();
        for entity in &self.config.entities {
            let since = self.store.pull_cursor(*entity)?;
            let incoming = self.remote.changed_since(*entity, since).await?;
            debug!(entity = %entity, since = ?since, count = incoming.len(), "Pulled changes");
            report.pulled += incoming.len();

            let cursor = incoming
                .iter()
                .filter_map(WireRecord::updated_millis)
                .map(Timestamp)
                .chain(since)
                .max();
            for wire in incoming {
                let Some(outcome) = self.merge_wire(*entity, wire)? else {
                    continue;
                };
                if outcome.changed {
                    report.merged += 1;
                }
                if outcome.newly_conflicted {
                    report.conflicts += 1;
                    newly_conflicted.push(outcome.record.uuid);
                }
            }
            if let Some(cursor) = cursor.filter(|c| Some(*c) != since) {
                self.store.set_pull_cursor(*entity, cursor)?;
            }
        }

        if let Some(strategy) = self.config.auto_resolve {
            for uuid in newly_conflicted {
                self.crdt.resolve(&uuid, strategy, None, self.clock.now())?;
                info!(uuid = %uuid, strategy = %strategy, "Conflict resolved automatically");
            }
        }

        self.refresh_references(report).await
    }

    /// Resolve a pulled record to a local uuid and merge it
    fn merge_wire(&self, entity: EntityKind, wire: WireRecord) -> SyncResult<Option<MergeOutcome>> {
        let uuid = match (&wire.uuid, &wire.server_id) {
            (Some(uuid), _) => uuid.clone(),
            (None, Some(server_id)) => match self.store.find_by_server_id(entity, server_id)? {
                Some(known) => known.uuid,
                None => RecordId::generate(),
            },
            (None, None) => {
                warn!(entity = %entity, "Pulled record has neither uuid nor server id; ignored");
                return Ok(None);
            }
        };

        let incoming = match wire.state {
            Some(mut state) if state.uuid == uuid => {
                state.entity = entity;
                if state.server_id.is_none() {
                    state.server_id = wire.server_id.clone();
                }
                state
            }
            _ => {
                let local = self.crdt.state(&uuid)?;
                let base = local
                    .as_ref()
                    .map(|s| s.acked_clock().clone())
                    .unwrap_or_default();
                let counter = wire
                    .updated_millis()
                    .unwrap_or_else(|| self.clock.now().as_millis());
                let held = RemoteSnapshot {
                    fields: wire.fields,
                    media: wire.media,
                    deleted: wire.deleted,
                };
                RecordState::synthesized(
                    uuid,
                    entity,
                    wire.server_id,
                    &held,
                    local.as_ref().and_then(RecordState::remote_snapshot),
                    &base,
                    counter,
                )
            }
        };
        Ok(Some(self.crdt.merge_remote(incoming)?))
    }

    async fn refresh_references(&self, report: &mut SyncReport) -> SyncResult<()> {
        for kind in &self.config.reference_kinds {
            match self.replace_reference(*kind).await {
                Ok(count) => report.references += count,
                Err(e) if e.is_auth() => return Err(e),
                Err(SyncError::Remote(e)) => {
                    warn!(kind = %kind, error = %e, "Reference refresh failed; cached rows kept");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fetch one reference kind and swap it into the cache
    async fn replace_reference(&self, kind: ReferenceKind) -> SyncResult<usize> {
        let items = self
            .remote
            .fetch_reference(kind, self.config.reference_page_size)
            .await?;
        let total = items.len();
        let rows: Vec<ReferenceRecord> = items
            .into_iter()
            .filter_map(|item| ReferenceRecord::from_json(kind, item))
            .collect();
        if rows.len() < total {
            warn!(kind = %kind, dropped = total - rows.len(), "Reference rows without an id ignored");
        }
        Ok(self.store.bulk_replace(kind, &rows, self.clock.now())?)
    }

    // ===== Reference caches =====

    /// Refresh one reference cache outside a pull cycle
    ///
    /// Works for any kind, configured or not. Fails without touching the
    /// cached rows when the network is not eligible or the fetch fails.
    pub async fn refresh_reference(&self, kind: ReferenceKind) -> SyncResult<usize> {
        if !self.can_sync() {
            return Err(SyncError::NotEligible(self.network()));
        }
        let count = self.replace_reference(kind).await?;
        info!(kind = %kind, count, "Reference cache refreshed");
        Ok(count)
    }

    /// Drop one cached reference kind; the next refresh repopulates it
    pub fn clear_reference(&self, kind: ReferenceKind) -> SyncResult<usize> {
        Ok(self.store.clear_references(kind)?)
    }

    // ===== Background cycle =====

    /// Start the periodic cycle; returns false if it is already running
    pub fn start_background_sync(self: &Arc<Self>, period: Duration) -> bool {
        let mut slot = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            debug!("Background sync already running");
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("No async runtime; background sync not started");
            return false;
        };

        let engine = Arc::downgrade(self);
        *slot = Some(handle.spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick fires immediately; the startup cycle covers it
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.sync_now().await {
                    warn!(error = %e, "Background sync cycle failed");
                }
            }
        }));
        info!(period = ?period, "Background sync started");
        true
    }

    /// Stop the periodic cycle
    ///
    /// A background cycle interrupted mid-push leaves its operations queued;
    /// they are sent again by the next cycle.
    pub fn stop_background_sync(&self) -> bool {
        let task = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.abort();
                info!("Background sync stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_background_running(&self) -> bool {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self
            .background
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
