//! Test fixtures for creating common test objects

use crate::config::SyncConfig;
use crate::core_store::crdt::CrdtStateManager;
use crate::core_store::model::{EntityKind, FieldMap, Record, RecordId, Timestamp};
use crate::core_store::store::LocalStore;
use crate::core_sync::clock::Clock;
use crate::core_sync::{NetworkState, SyncEngine};
use super::memory_remote::MemoryRemote;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 2023-11-14T22:13:20Z
pub const START_MILLIS: u64 = 1_700_000_000_000;

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Arc<Self> {
        Arc::new(ManualClock {
            millis: AtomicU64::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

pub fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// New, unsaved observation
pub fn observation(pairs: &[(&str, Value)]) -> Record {
    Record::draft(EntityKind::Observation, fields(pairs))
}

/// Observation with a fixed uuid
pub fn observation_with_uuid(uuid: &str, pairs: &[(&str, Value)]) -> Record {
    let mut record = observation(pairs);
    record.uuid = RecordId::from(uuid);
    record
}

/// Deterministic engine settings: no pushes after writes, no timer, any connection
pub fn test_config() -> SyncConfig {
    SyncConfig {
        auto_sync: false,
        background_sync: false,
        wifi_only: false,
        max_retries: 3,
        reference_kinds: Vec::new(),
        ..SyncConfig::default()
    }
}

/// One device: its own in-memory store and node id, sharing a remote and clock
pub struct TestDevice {
    pub store: Arc<LocalStore>,
    pub crdt: Arc<CrdtStateManager>,
    pub engine: Arc<SyncEngine>,
}

impl TestDevice {
    /// Online device with `test_config`
    pub fn new(node: &str, remote: Arc<MemoryRemote>, clock: Arc<ManualClock>) -> Self {
        Self::with_config(node, remote, clock, test_config())
    }

    pub fn with_config(
        node: &str,
        remote: Arc<MemoryRemote>,
        clock: Arc<ManualClock>,
        config: SyncConfig,
    ) -> Self {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let crdt = Arc::new(CrdtStateManager::new(Arc::clone(&store), node));
        crdt.init().unwrap();
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&crdt),
            remote,
            clock,
            config,
        ));
        engine.set_network(NetworkState::Unmetered);
        TestDevice { store, crdt, engine }
    }

    /// Current view of a record that must exist
    pub fn record(&self, uuid: &RecordId) -> Record {
        self.engine
            .get_observation(uuid)
            .unwrap()
            .unwrap_or_else(|| panic!("record {} missing", uuid))
    }
}
