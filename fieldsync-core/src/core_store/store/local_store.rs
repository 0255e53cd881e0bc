/*
    local_store.rs - Durable, transactional record and queue storage

    Holds on-device state in SQLite:
    - One table per entity kind with the materialized records
    - The operation queue
    - Per-record merge state
    - Reference caches, sync metadata and sync history

    Architecture:
    - r2d2 connection pool, WAL journal for file databases
    - Every public write runs as one transaction behind a process-wide
      write gate, so push and pull paths never interleave partial writes
    - Failures always propagate; a lost local write is never silent
*/

use super::errors::{StoreError, StoreResult};
use super::migrations;
use crate::core_store::crdt::{NodeId, RecordState};
use crate::core_store::model::{
    CycleKind, CycleOutcome, EntityKind, OperationId, OperationKind, OperationStatus,
    PendingOperation, QueueChange, Record, RecordId, ReferenceKind, ReferenceRecord,
    SyncHistoryEntry, Timestamp,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Helper to convert poison errors into StoreError
fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Internal("Lock poisoned: a thread panicked while holding the write gate".to_string())
}

const META_NODE_ID: &str = "node_id";
const META_LAST_SYNC: &str = "last_sync_time";

const RECORD_COLUMNS: &str =
    "local_id, uuid, server_id, fields, media, deleted, synced, conflict, conflict_data, updated_at";
const OPERATION_COLUMNS: &str =
    "seq, id, target_uuid, entity, kind, payload, enqueued_at, retry_count, last_error, status";

/// Configuration for local storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Maximum pooled connections
    pub pool_size: u32,

    /// How long a connection waits on a locked database
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        LocalStoreConfig {
            path: PathBuf::from("./data/fieldsync.db"),
            pool_size: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Which rows of an entity table to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    Live,
    Unsynced,
    Conflicted,
}

impl RecordFilter {
    fn where_clause(&self) -> &'static str {
        match self {
            RecordFilter::All => "1 = 1",
            RecordFilter::Live => "deleted = 0",
            RecordFilter::Unsynced => "synced = 0",
            RecordFilter::Conflicted => "conflict = 1",
        }
    }
}

/// Counts reported to operators (records across every entity table)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub records: usize,
    pub synced: usize,
    pub unsynced: usize,
    pub conflicts: usize,
    pub deleted: usize,
    pub pending_operations: usize,
    /// Queued operations that failed at least once
    pub failed_operations: usize,
    /// Queued operations at or past the retry ceiling
    pub exhausted_operations: usize,
    pub last_sync_time: Option<Timestamp>,
}

struct RecordRow {
    local_id: i64,
    uuid: String,
    server_id: Option<String>,
    fields: String,
    media: String,
    deleted: bool,
    synced: bool,
    conflict: bool,
    conflict_data: Option<String>,
    updated_at: i64,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RecordRow {
            local_id: row.get(0)?,
            uuid: row.get(1)?,
            server_id: row.get(2)?,
            fields: row.get(3)?,
            media: row.get(4)?,
            deleted: row.get(5)?,
            synced: row.get(6)?,
            conflict: row.get(7)?,
            conflict_data: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_record(self, entity: EntityKind) -> StoreResult<Record> {
        Ok(Record {
            local_id: Some(self.local_id),
            uuid: RecordId(self.uuid),
            entity,
            server_id: self.server_id,
            fields: serde_json::from_str(&self.fields)?,
            media: serde_json::from_str(&self.media)?,
            deleted: self.deleted,
            synced: self.synced,
            conflict: self.conflict,
            conflict_data: self
                .conflict_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            timestamp: Timestamp(self.updated_at.max(0) as u64),
        })
    }
}

struct OperationRow {
    seq: i64,
    id: String,
    target_uuid: String,
    entity: String,
    kind: String,
    payload: String,
    enqueued_at: i64,
    retry_count: i64,
    last_error: Option<String>,
    status: String,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(OperationRow {
            seq: row.get(0)?,
            id: row.get(1)?,
            target_uuid: row.get(2)?,
            entity: row.get(3)?,
            kind: row.get(4)?,
            payload: row.get(5)?,
            enqueued_at: row.get(6)?,
            retry_count: row.get(7)?,
            last_error: row.get(8)?,
            status: row.get(9)?,
        })
    }

    fn into_operation(self) -> StoreResult<PendingOperation> {
        Ok(PendingOperation {
            id: OperationId(self.id),
            seq: self.seq,
            target_uuid: RecordId(self.target_uuid),
            entity: self.entity.parse::<EntityKind>().map_err(StoreError::Serialization)?,
            kind: self.kind.parse::<OperationKind>().map_err(StoreError::Serialization)?,
            payload: serde_json::from_str(&self.payload)?,
            enqueued_at: Timestamp(self.enqueued_at.max(0) as u64),
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            status: OperationStatus::parse(&self.status),
        })
    }
}

fn upsert_record(conn: &Connection, record: &Record) -> StoreResult<i64> {
    let table = record.entity.table();
    let conflict_data = record
        .conflict_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (uuid, server_id, fields, media, deleted, synced, conflict, conflict_data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(uuid) DO UPDATE SET
                server_id = excluded.server_id,
                fields = excluded.fields,
                media = excluded.media,
                deleted = excluded.deleted,
                synced = excluded.synced,
                conflict = excluded.conflict,
                conflict_data = excluded.conflict_data,
                updated_at = excluded.updated_at"
        ),
        params![
            record.uuid.as_str(),
            record.server_id,
            serde_json::to_string(&record.fields)?,
            serde_json::to_string(&record.media)?,
            record.deleted,
            record.synced,
            record.conflict,
            conflict_data,
            record.timestamp.as_millis() as i64,
        ],
    )?;
    let local_id = conn.query_row(
        &format!("SELECT local_id FROM {table} WHERE uuid = ?1"),
        params![record.uuid.as_str()],
        |row| row.get(0),
    )?;
    Ok(local_id)
}

fn insert_operation(conn: &Connection, op: &PendingOperation) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO pending_operations
            (id, target_uuid, entity, kind, payload, enqueued_at, retry_count, last_error, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            op.id.as_str(),
            op.target_uuid.as_str(),
            op.entity.as_str(),
            op.kind.as_str(),
            serde_json::to_string(&op.payload)?,
            op.enqueued_at.as_millis() as i64,
            op.retry_count,
            op.last_error,
            OperationStatus::Queued.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Main local storage interface
pub struct LocalStore {
    pool: Pool<SqliteConnectionManager>,
    write_gate: Mutex<()>,
}

impl LocalStore {
    /// Open (or create) a file-backed store and bring its schema up to date
    pub fn open(config: &LocalStoreConfig) -> StoreResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")
        });
        let pool = Pool::builder().max_size(config.pool_size.max(1)).build(manager)?;

        info!(path = %config.path.display(), "Opening local store");
        Self::from_pool(pool)
    }

    /// Store backed by a private in-memory database
    pub fn in_memory() -> StoreResult<Self> {
        // every pooled in-memory connection is its own database, so keep one
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::from_pool(pool)
    }

    /// Wrap an existing pool, run migrations and requeue interrupted operations
    pub fn from_pool(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        migrations::migrate(&pool)?;
        let store = LocalStore {
            pool,
            write_gate: Mutex::new(()),
        };
        let recovered = store.recover_in_flight()?;
        if recovered > 0 {
            warn!(recovered, "Requeued operations interrupted mid-flight");
        }
        Ok(store)
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside one transaction behind the write gate
    fn write<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let _guard = self.write_gate.lock().map_err(handle_poison)?;
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ===== Records =====

    /// Insert or update a materialized record, keeping its local row key
    pub fn put(&self, record: &Record) -> StoreResult<Record> {
        let local_id = self.write(|conn| upsert_record(conn, record))?;
        let mut stored = record.clone();
        stored.local_id = Some(local_id);
        Ok(stored)
    }

    pub fn get(&self, entity: EntityKind, uuid: &RecordId) -> StoreResult<Option<Record>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM {} WHERE uuid = ?1", entity.table()),
                params![uuid.as_str()],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(|r| r.into_record(entity)).transpose()
    }

    /// Look a record up without knowing its entity kind
    pub fn query_by_uuid(&self, uuid: &RecordId) -> StoreResult<Option<Record>> {
        for entity in EntityKind::ALL {
            if let Some(record) = self.get(entity, uuid)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub fn find_by_server_id(
        &self,
        entity: EntityKind,
        server_id: &str,
    ) -> StoreResult<Option<Record>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE server_id = ?1 LIMIT 1",
                    entity.table()
                ),
                params![server_id],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(|r| r.into_record(entity)).transpose()
    }

    pub fn list_records(&self, entity: EntityKind, filter: RecordFilter) -> StoreResult<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE {} ORDER BY local_id",
            entity.table(),
            filter.where_clause()
        ))?;
        let rows = stmt
            .query_map([], RecordRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(|r| r.into_record(entity)).collect()
    }

    // ===== Merge state =====

    pub fn load_states(&self) -> StoreResult<Vec<RecordState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state FROM crdt_state ORDER BY uuid")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    /// Persist merge state, its materialized record and a queue change atomically
    ///
    /// `synced` is recomputed here: true only when the record carries no
    /// conflict and no operation for it remains queued.
    pub fn commit_merge(
        &self,
        state: &RecordState,
        record: &Record,
        change: &QueueChange,
    ) -> StoreResult<Record> {
        let state_json = serde_json::to_string(state)?;
        self.write(|conn| {
            conn.execute(
                "INSERT INTO crdt_state (uuid, entity, state, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(uuid) DO UPDATE SET
                    entity = excluded.entity,
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![
                    state.uuid.as_str(),
                    state.entity.as_str(),
                    state_json,
                    state.timestamp().as_millis() as i64,
                ],
            )?;

            match change {
                QueueChange::None => {}
                QueueChange::Enqueue(op) => {
                    insert_operation(conn, op)?;
                }
                QueueChange::Acknowledge(op_id) => {
                    conn.execute(
                        "DELETE FROM pending_operations WHERE id = ?1",
                        params![op_id.as_str()],
                    )?;
                }
            }

            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_operations WHERE target_uuid = ?1",
                params![record.uuid.as_str()],
                |row| row.get(0),
            )?;
            let mut stored = record.clone();
            stored.synced = !stored.conflict && pending == 0;
            stored.local_id = Some(upsert_record(conn, &stored)?);
            Ok(stored)
        })
    }

    // ===== Operation queue =====

    /// Append an operation; returns its sequence number
    pub fn enqueue(&self, op: &PendingOperation) -> StoreResult<i64> {
        let seq = self.write(|conn| insert_operation(conn, op))?;
        debug!(op = %op.id, kind = op.kind.as_str(), seq, "Operation enqueued");
        Ok(seq)
    }

    /// Remove an acknowledged operation
    pub fn dequeue(&self, op_id: &OperationId) -> StoreResult<bool> {
        let removed = self.write(|conn| {
            Ok(conn.execute(
                "DELETE FROM pending_operations WHERE id = ?1",
                params![op_id.as_str()],
            )?)
        })?;
        Ok(removed > 0)
    }

    /// Every queued operation in enqueue order
    pub fn list_pending(&self) -> StoreResult<Vec<PendingOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map([], OperationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    pub fn get_operation(&self, op_id: &OperationId) -> StoreResult<Option<PendingOperation>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?1"),
                params![op_id.as_str()],
                OperationRow::from_row,
            )
            .optional()?;
        row.map(OperationRow::into_operation).transpose()
    }

    pub fn pending_count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn mark_in_flight(&self, op_id: &OperationId) -> StoreResult<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE pending_operations SET status = ?1 WHERE id = ?2",
                params![OperationStatus::InFlight.as_str(), op_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Return a failed operation to the queue with its error recorded
    pub fn record_failure(
        &self,
        op_id: &OperationId,
        error: &str,
        count_retry: bool,
    ) -> StoreResult<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE pending_operations
                 SET status = ?1, last_error = ?2, retry_count = retry_count + ?3
                 WHERE id = ?4",
                params![
                    OperationStatus::Queued.as_str(),
                    error,
                    if count_retry { 1 } else { 0 },
                    op_id.as_str()
                ],
            )?;
            Ok(())
        })
    }

    /// Put every in-flight operation back in the queue; order is preserved by seq
    pub fn recover_in_flight(&self) -> StoreResult<usize> {
        self.write(|conn| {
            Ok(conn.execute(
                "UPDATE pending_operations SET status = ?1 WHERE status = ?2",
                params![OperationStatus::Queued.as_str(), OperationStatus::InFlight.as_str()],
            )?)
        })
    }

    /// Re-arm an exhausted operation
    pub fn reset_retries(&self, op_id: &OperationId) -> StoreResult<bool> {
        let updated = self.write(|conn| {
            Ok(conn.execute(
                "UPDATE pending_operations SET retry_count = 0, last_error = NULL WHERE id = ?1",
                params![op_id.as_str()],
            )?)
        })?;
        Ok(updated > 0)
    }

    /// Operator-initiated removal of a queued intent
    pub fn discard(&self, op_id: &OperationId) -> StoreResult<Option<PendingOperation>> {
        let Some(op) = self.get_operation(op_id)? else {
            return Ok(None);
        };
        self.dequeue(op_id)?;
        warn!(op = %op_id, target = %op.target_uuid, kind = op.kind.as_str(), "Queued operation discarded");
        Ok(Some(op))
    }

    // ===== Reference caches =====

    /// Replace a reference cache wholesale
    pub fn bulk_replace(
        &self,
        kind: ReferenceKind,
        records: &[ReferenceRecord],
        refreshed_at: Timestamp,
    ) -> StoreResult<usize> {
        let table = kind.table();
        self.write(|conn| {
            conn.execute(&format!("DELETE FROM {table}"), [])?;
            let mut stmt = conn.prepare(&format!(
                "INSERT OR REPLACE INTO {table} (server_id, name, data, refreshed_at) VALUES (?1, ?2, ?3, ?4)"
            ))?;
            for record in records {
                stmt.execute(params![
                    record.server_id,
                    record.name,
                    serde_json::to_string(&record.data)?,
                    refreshed_at.as_millis() as i64,
                ])?;
            }
            Ok(records.len())
        })
    }

    /// Drop every cached row of one kind; returns how many were removed
    pub fn clear_references(&self, kind: ReferenceKind) -> StoreResult<usize> {
        let table = kind.table();
        let removed = self.write(|conn| Ok(conn.execute(&format!("DELETE FROM {table}"), [])?))?;
        if removed > 0 {
            info!(kind = %kind, removed, "Reference cache cleared");
        }
        Ok(removed)
    }

    pub fn reference(
        &self,
        kind: ReferenceKind,
        server_id: &str,
    ) -> StoreResult<Option<ReferenceRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT server_id, name, data FROM {} WHERE server_id = ?1", kind.table()),
                params![server_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(server_id, name, data)| {
            Ok(ReferenceRecord {
                server_id,
                name,
                data: serde_json::from_str(&data)?,
            })
        })
        .transpose()
    }

    pub fn reference_count(&self, kind: ReferenceKind) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ===== Metadata =====

    pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// This device's origin id, generated on first use
    pub fn node_id(&self) -> StoreResult<NodeId> {
        self.write(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT value FROM sync_metadata WHERE key = ?1",
                    params![META_NODE_ID],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            let id = format!("device-{}", uuid::Uuid::new_v4());
            conn.execute(
                "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)",
                params![META_NODE_ID, id],
            )?;
            info!(node = %id, "Generated device origin id");
            Ok(id)
        })
    }

    pub fn last_sync_time(&self) -> StoreResult<Option<Timestamp>> {
        Ok(self
            .get_meta(META_LAST_SYNC)?
            .and_then(|v| v.parse::<u64>().ok())
            .map(Timestamp))
    }

    pub fn set_last_sync_time(&self, at: Timestamp) -> StoreResult<()> {
        self.set_meta(META_LAST_SYNC, &at.as_millis().to_string())
    }

    /// High-water mark of the last successful pull for one entity kind
    pub fn pull_cursor(&self, entity: EntityKind) -> StoreResult<Option<Timestamp>> {
        Ok(self
            .get_meta(&format!("last_pull:{}", entity.as_str()))?
            .and_then(|v| v.parse::<u64>().ok())
            .map(Timestamp))
    }

    pub fn set_pull_cursor(&self, entity: EntityKind, at: Timestamp) -> StoreResult<()> {
        self.set_meta(&format!("last_pull:{}", entity.as_str()), &at.as_millis().to_string())
    }

    // ===== History =====

    pub fn append_history(&self, entry: &SyncHistoryEntry) -> StoreResult<i64> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO sync_history (kind, started_at, finished_at, pushed, pulled, outcome, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.kind.as_str(),
                    entry.started_at.as_millis() as i64,
                    entry.finished_at.as_millis() as i64,
                    entry.pushed,
                    entry.pulled,
                    entry.outcome.as_str(),
                    entry.error,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent cycles first
    pub fn recent_history(&self, limit: usize) -> StoreResult<Vec<SyncHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, started_at, finished_at, pushed, pulled, outcome, error
             FROM sync_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, kind, started, finished, pushed, pulled, outcome, error)| {
                Ok(SyncHistoryEntry {
                    id: Some(id),
                    kind: kind.parse::<CycleKind>().map_err(StoreError::Serialization)?,
                    started_at: Timestamp(started.max(0) as u64),
                    finished_at: Timestamp(finished.max(0) as u64),
                    pushed,
                    pulled,
                    outcome: outcome.parse::<CycleOutcome>().map_err(StoreError::Serialization)?,
                    error,
                })
            })
            .collect()
    }

    // ===== Stats =====

    pub fn stats(&self, max_retries: u32) -> StoreResult<StoreStats> {
        let mut stats = StoreStats::default();
        {
            let conn = self.conn()?;
            for entity in EntityKind::ALL {
                let (total, synced, conflicts, deleted): (i64, i64, i64, i64) = conn.query_row(
                    &format!(
                        "SELECT COUNT(*),
                                COALESCE(SUM(synced), 0),
                                COALESCE(SUM(conflict), 0),
                                COALESCE(SUM(deleted), 0)
                         FROM {}",
                        entity.table()
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
                stats.records += total as usize;
                stats.synced += synced as usize;
                stats.conflicts += conflicts as usize;
                stats.deleted += deleted as usize;
            }
            stats.unsynced = stats.records - stats.synced;

            let (pending, failed, exhausted): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN retry_count > 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN retry_count >= ?1 THEN 1 ELSE 0 END), 0)
                 FROM pending_operations",
                params![max_retries],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            stats.pending_operations = pending as usize;
            stats.failed_operations = failed as usize;
            stats.exhausted_operations = exhausted as usize;
        }
        stats.last_sync_time = self.last_sync_time()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::FieldMap;
    use serde_json::json;
    use tempfile::tempdir;

    fn observation(uuid: &str, moisture: f64) -> Record {
        let mut fields = FieldMap::new();
        fields.insert("moisture".into(), json!(moisture));
        let mut record = Record::draft(EntityKind::Observation, fields);
        record.uuid = RecordId::from(uuid);
        record
    }

    fn op(uuid: &str, kind: OperationKind, at: u64) -> PendingOperation {
        PendingOperation::new(
            RecordId::from(uuid),
            EntityKind::Observation,
            kind,
            json!({"fields": ["moisture"]}),
            Timestamp(at),
        )
    }

    #[test]
    fn test_put_preserves_local_id() {
        let store = LocalStore::in_memory().unwrap();
        let first = store.put(&observation("abc", 12.0)).unwrap();
        let local_id = first.local_id.unwrap();

        let mut changed = observation("abc", 14.0);
        changed.server_id = Some("42".into());
        let second = store.put(&changed).unwrap();
        assert_eq!(second.local_id, Some(local_id));

        let loaded = store.get(EntityKind::Observation, &RecordId::from("abc")).unwrap().unwrap();
        assert_eq!(loaded.fields["moisture"], json!(14.0));
        assert_eq!(loaded.server_id.as_deref(), Some("42"));
        assert_eq!(loaded.local_id, Some(local_id));
    }

    #[test]
    fn test_query_by_uuid_and_server_id() {
        let store = LocalStore::in_memory().unwrap();
        let mut trial = Record::draft(EntityKind::Trial, FieldMap::new());
        trial.server_id = Some("T-9".into());
        store.put(&trial).unwrap();

        let found = store.query_by_uuid(&trial.uuid).unwrap().unwrap();
        assert_eq!(found.entity, EntityKind::Trial);
        assert!(store.find_by_server_id(EntityKind::Trial, "T-9").unwrap().is_some());
        assert!(store.find_by_server_id(EntityKind::Observation, "T-9").unwrap().is_none());
    }

    #[test]
    fn test_queue_fifo_and_dequeue() {
        let store = LocalStore::in_memory().unwrap();
        let a = op("abc", OperationKind::Create, 5);
        let b = op("abc", OperationKind::Update, 5);
        let c = op("def", OperationKind::Create, 4);
        store.enqueue(&a).unwrap();
        store.enqueue(&b).unwrap();
        store.enqueue(&c).unwrap();

        let pending = store.list_pending().unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone(), c.id.clone()]);
        assert!(pending[0].seq < pending[1].seq);

        assert!(store.dequeue(&a.id).unwrap());
        assert!(!store.dequeue(&a.id).unwrap());
        assert_eq!(store.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_failure_bookkeeping() {
        let store = LocalStore::in_memory().unwrap();
        let a = op("abc", OperationKind::Create, 1);
        store.enqueue(&a).unwrap();

        store.mark_in_flight(&a.id).unwrap();
        assert_eq!(store.get_operation(&a.id).unwrap().unwrap().status, OperationStatus::InFlight);

        store.record_failure(&a.id, "server error (503)", true).unwrap();
        store.record_failure(&a.id, "authorization failed", false).unwrap();
        let loaded = store.get_operation(&a.id).unwrap().unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.status, OperationStatus::Queued);
        assert_eq!(loaded.last_error.as_deref(), Some("authorization failed"));

        assert!(store.reset_retries(&a.id).unwrap());
        assert_eq!(store.get_operation(&a.id).unwrap().unwrap().retry_count, 0);
    }

    #[test]
    fn test_in_flight_recovered_on_reopen() {
        let dir = tempdir().unwrap();
        let config = LocalStoreConfig {
            path: dir.path().join("field.db"),
            ..Default::default()
        };

        let a = op("abc", OperationKind::Create, 1);
        let b = op("abc", OperationKind::Update, 2);
        {
            let store = LocalStore::open(&config).unwrap();
            store.enqueue(&a).unwrap();
            store.enqueue(&b).unwrap();
            store.mark_in_flight(&a.id).unwrap();
        }

        let reopened = LocalStore::open(&config).unwrap();
        let pending = reopened.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(pending[0].status, OperationStatus::Queued);
        assert_eq!(pending[1].id, b.id);
    }

    #[test]
    fn test_commit_merge_sets_synced_from_queue() {
        let store = LocalStore::in_memory().unwrap();
        let mut state = RecordState::new(RecordId::from("abc"), EntityKind::Observation);
        let mut fields = FieldMap::new();
        fields.insert("moisture".into(), json!(12));
        state.edit_fields("tablet-a", &fields, Timestamp(1));
        let record = state.materialize();

        let create = op("abc", OperationKind::Create, 1);
        let stored = store
            .commit_merge(&state, &record, &QueueChange::Enqueue(create.clone()))
            .unwrap();
        assert!(!stored.synced);
        assert_eq!(store.pending_count().unwrap(), 1);

        let acked = store
            .commit_merge(&state, &record, &QueueChange::Acknowledge(create.id.clone()))
            .unwrap();
        assert!(acked.synced);
        assert_eq!(acked.local_id, stored.local_id);
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(store.load_states().unwrap(), vec![state]);
    }

    #[test]
    fn test_bulk_replace_reference_cache() {
        let store = LocalStore::in_memory().unwrap();
        let first = vec![
            ReferenceRecord { server_id: "G1".into(), name: Some("IR64".into()), data: json!({}) },
            ReferenceRecord { server_id: "G2".into(), name: None, data: json!({}) },
        ];
        assert_eq!(store.bulk_replace(ReferenceKind::Germplasm, &first, Timestamp(1)).unwrap(), 2);

        let second = vec![ReferenceRecord {
            server_id: "G3".into(),
            name: Some("Nipponbare".into()),
            data: json!({"species": "japonica"}),
        }];
        store.bulk_replace(ReferenceKind::Germplasm, &second, Timestamp(2)).unwrap();

        assert_eq!(store.reference_count(ReferenceKind::Germplasm).unwrap(), 1);
        assert!(store.reference(ReferenceKind::Germplasm, "G1").unwrap().is_none());
        let g3 = store.reference(ReferenceKind::Germplasm, "G3").unwrap().unwrap();
        assert_eq!(g3.data["species"], json!("japonica"));
    }

    #[test]
    fn test_clear_references_leaves_other_kinds() {
        let store = LocalStore::in_memory().unwrap();
        let row = |id: &str| ReferenceRecord { server_id: id.into(), name: None, data: json!({}) };
        store
            .bulk_replace(ReferenceKind::Germplasm, &[row("G1"), row("G2")], Timestamp(1))
            .unwrap();
        store.bulk_replace(ReferenceKind::Trait, &[row("T1")], Timestamp(1)).unwrap();

        assert_eq!(store.clear_references(ReferenceKind::Germplasm).unwrap(), 2);
        assert_eq!(store.reference_count(ReferenceKind::Germplasm).unwrap(), 0);
        assert_eq!(store.reference_count(ReferenceKind::Trait).unwrap(), 1);
        // already empty
        assert_eq!(store.clear_references(ReferenceKind::Germplasm).unwrap(), 0);
    }

    #[test]
    fn test_node_id_stable() {
        let store = LocalStore::in_memory().unwrap();
        let first = store.node_id().unwrap();
        assert!(first.starts_with("device-"));
        assert_eq!(store.node_id().unwrap(), first);
    }

    #[test]
    fn test_history_and_stats() {
        let store = LocalStore::in_memory().unwrap();
        store
            .append_history(&SyncHistoryEntry {
                id: None,
                kind: CycleKind::Full,
                started_at: Timestamp(10),
                finished_at: Timestamp(20),
                pushed: 3,
                pulled: 1,
                outcome: CycleOutcome::Ok,
                error: None,
            })
            .unwrap();
        store.set_last_sync_time(Timestamp(20)).unwrap();

        let mut synced = observation("abc", 1.0);
        synced.synced = true;
        store.put(&synced).unwrap();
        store.put(&observation("def", 2.0)).unwrap();
        let mut failing = op("def", OperationKind::Create, 1);
        failing.retry_count = 5;
        store.enqueue(&failing).unwrap();

        let history = store.recent_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].pushed, 3);

        let stats = store.stats(5).unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.unsynced, 1);
        assert_eq!(stats.pending_operations, 1);
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(stats.exhausted_operations, 1);
        assert_eq!(stats.last_sync_time, Some(Timestamp(20)));
    }

    #[test]
    fn test_discard_returns_operation() {
        let store = LocalStore::in_memory().unwrap();
        let a = op("abc", OperationKind::Create, 1);
        store.enqueue(&a).unwrap();
        let discarded = store.discard(&a.id).unwrap().unwrap();
        assert_eq!(discarded.kind, OperationKind::Create);
        assert!(store.discard(&a.id).unwrap().is_none());
        assert_eq!(store.pending_count().unwrap(), 0);
    }
}
