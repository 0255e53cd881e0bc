//! In-memory remote API double
//!
//! Behaves like a server that keeps merge state: creates are idempotent by
//! uuid, updates merge the sent state into the stored one, deletes keep a
//! tombstone. Server ids are numeric and start at 42. Failures can be
//! scripted per call or made permanent, and every call is logged.

use crate::core_store::crdt::{Crdt, RecordState};
use crate::core_store::model::{EntityKind, RecordId, ReferenceKind, Timestamp};
use crate::core_sync::clock::Clock;
use crate::core_sync::remote::{RemoteApi, RemoteError, RemoteResult, WireRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FIRST_SERVER_ID: u64 = 42;

#[derive(Debug, Clone)]
struct ServerRecord {
    entity: EntityKind,
    server_id: String,
    wire: WireRecord,
    changed_at: Timestamp,
}

#[derive(Default)]
struct Inner {
    records: Vec<ServerRecord>,
    next_id: u64,
    scripted: VecDeque<RemoteError>,
    always: Option<RemoteError>,
    references: HashMap<ReferenceKind, Vec<Value>>,
    calls: Vec<String>,
    delay: Option<Duration>,
    keep_state: bool,
}

pub struct MemoryRemote {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryRemote {
    /// Server that stores and merges the full merge state
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryRemote {
            inner: Mutex::new(Inner {
                next_id: FIRST_SERVER_ID,
                keep_state: true,
                ..Default::default()
            }),
            clock,
        }
    }

    /// Server that stores plain values only and answers without merge state
    pub fn plain(clock: Arc<dyn Clock>) -> Self {
        let remote = Self::new(clock);
        remote.lock().keep_state = false;
        remote
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Fail the next call with `err`; queued failures are consumed in order
    pub fn fail_next(&self, err: RemoteError) {
        self.lock().scripted.push_back(err);
    }

    /// Fail every call until cleared
    pub fn fail_always(&self, err: Option<RemoteError>) {
        self.lock().always = err;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn set_references(&self, kind: ReferenceKind, items: Vec<Value>) {
        self.lock().references.insert(kind, items);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn record_count(&self, entity: EntityKind) -> usize {
        self.lock().records.iter().filter(|r| r.entity == entity).count()
    }

    /// Stored view of a record, looked up by uuid
    pub fn record(&self, uuid: &RecordId) -> Option<WireRecord> {
        self.lock()
            .records
            .iter()
            .find(|r| r.wire.uuid.as_ref() == Some(uuid))
            .map(|r| r.wire.clone())
    }

    /// Insert a record as if another client had written it
    pub fn seed(&self, entity: EntityKind, mut wire: WireRecord) -> String {
        let now = self.clock.now();
        let mut inner = self.lock();
        let server_id = inner.next_id.to_string();
        inner.next_id += 1;
        wire.server_id = Some(server_id.clone());
        wire.updated_at = Some(now.to_datetime());
        inner.records.push(ServerRecord {
            entity,
            server_id: server_id.clone(),
            wire,
            changed_at: now,
        });
        server_id
    }

    /// Log the call, then apply the delay and any injected failure
    async fn enter(&self, call: String) -> RemoteResult<()> {
        let (delay, failure) = {
            let mut inner = self.lock();
            inner.calls.push(call);
            let failure = match inner.scripted.pop_front() {
                Some(err) => Some(err),
                None => inner.always.clone(),
            };
            (inner.delay, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Merge state carried by a body, combined with what the server already holds
    fn merged_state(stored: Option<&WireRecord>, sent: &WireRecord) -> Option<RecordState> {
        let mut state = sent.state.clone()?;
        if let Some(existing) = stored.and_then(|w| w.state.as_ref()) {
            state.merge(existing).ok()?;
        }
        Some(state)
    }

    /// Stored form of a body: the materialized view of the merged state when there is one
    fn store_body(
        stored: Option<&WireRecord>,
        sent: &WireRecord,
        server_id: &str,
        now: Timestamp,
        keep_state: bool,
    ) -> WireRecord {
        let mut body = match Self::merged_state(stored, sent) {
            Some(mut state) => {
                state.server_id = Some(server_id.to_string());
                let mut body = WireRecord::from_state(&state);
                if !keep_state {
                    body.state = None;
                }
                body
            }
            None => sent.clone(),
        };
        body.server_id = Some(server_id.to_string());
        body.updated_at = Some(now.to_datetime());
        body
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn create_batch(
        &self,
        entity: EntityKind,
        records: &[WireRecord],
    ) -> RemoteResult<Vec<WireRecord>> {
        self.enter(format!("POST {} x{}", entity.collection(), records.len()))
            .await?;
        let now = self.clock.now();
        let mut inner = self.lock();
        let keep_state = inner.keep_state;
        let mut created = Vec::with_capacity(records.len());

        for sent in records {
            let existing = inner.records.iter().position(|r| {
                r.entity == entity && sent.uuid.is_some() && r.wire.uuid == sent.uuid
            });
            match existing {
                Some(index) => {
                    let server_id = inner.records[index].server_id.clone();
                    let body = Self::store_body(
                        Some(&inner.records[index].wire),
                        sent,
                        &server_id,
                        now,
                        keep_state,
                    );
                    inner.records[index].wire = body.clone();
                    inner.records[index].changed_at = now;
                    created.push(body);
                }
                None => {
                    let server_id = inner.next_id.to_string();
                    inner.next_id += 1;
                    let body = Self::store_body(None, sent, &server_id, now, keep_state);
                    inner.records.push(ServerRecord {
                        entity,
                        server_id,
                        wire: body.clone(),
                        changed_at: now,
                    });
                    created.push(body);
                }
            }
        }
        Ok(created)
    }

    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        record: &WireRecord,
    ) -> RemoteResult<Option<WireRecord>> {
        self.enter(format!("PUT {}/{}", entity.collection(), id)).await?;
        let now = self.clock.now();
        let mut inner = self.lock();
        let keep_state = inner.keep_state;
        let index = inner
            .records
            .iter()
            .position(|r| {
                r.entity == entity
                    && (r.server_id == id || r.wire.uuid.as_ref().map(RecordId::as_str) == Some(id))
            })
            .ok_or_else(|| RemoteError::from_status(404, format!("no record {}", id)))?;

        let server_id = inner.records[index].server_id.clone();
        let body = Self::store_body(
            Some(&inner.records[index].wire),
            record,
            &server_id,
            now,
            keep_state,
        );
        inner.records[index].wire = body.clone();
        inner.records[index].changed_at = now;
        Ok(Some(body))
    }

    async fn delete(&self, entity: EntityKind, id: &str) -> RemoteResult<()> {
        self.enter(format!("DELETE {}/{}", entity.collection(), id)).await?;
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some(stored) = inner.records.iter_mut().find(|r| {
            r.entity == entity
                && (r.server_id == id || r.wire.uuid.as_ref().map(RecordId::as_str) == Some(id))
        }) {
            // plain tombstone; clients synthesize it against what they have acknowledged
            stored.wire.deleted = true;
            stored.wire.state = None;
            stored.wire.updated_at = Some(now.to_datetime());
            stored.changed_at = now;
        }
        Ok(())
    }

    async fn changed_since(
        &self,
        entity: EntityKind,
        since: Option<Timestamp>,
    ) -> RemoteResult<Vec<WireRecord>> {
        self.enter(format!("GET {}", entity.collection())).await?;
        let inner = self.lock();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.entity == entity)
            .filter(|r| since.map_or(true, |since| r.changed_at >= since))
            .map(|r| r.wire.clone())
            .collect())
    }

    async fn fetch_reference(
        &self,
        kind: ReferenceKind,
        page_size: usize,
    ) -> RemoteResult<Vec<Value>> {
        self.enter(format!("GET {}", kind.collection())).await?;
        let inner = self.lock();
        Ok(inner
            .references
            .get(&kind)
            .map(|items| items.iter().take(page_size).cloned().collect())
            .unwrap_or_default())
    }
}
