//! Database migrations for the local store
//!
//! Provides versioned migrations for the record, queue and metadata schema.
//! Each migration is applied atomically and tracked in the schema_version table.

use super::errors::{StoreError, StoreResult};
use crate::core_store::model::{EntityKind, ReferenceKind, Timestamp};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::info;

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: String,
}

fn entity_table_sql(kind: EntityKind) -> String {
    let table = kind.table();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            server_id TEXT,
            fields TEXT NOT NULL,                   -- JSON object
            media TEXT NOT NULL,                    -- JSON array
            deleted INTEGER NOT NULL DEFAULT 0,
            synced INTEGER NOT NULL DEFAULT 0,
            conflict INTEGER NOT NULL DEFAULT 0,
            conflict_data TEXT,                     -- JSON, present while conflicted
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table}(synced);
        CREATE INDEX IF NOT EXISTS idx_{table}_server_id ON {table}(server_id);
        "#
    )
}

fn reference_table_sql(kind: ReferenceKind) -> String {
    let table = kind.table();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            server_id TEXT PRIMARY KEY,
            name TEXT,
            data TEXT NOT NULL,
            refreshed_at INTEGER NOT NULL
        );
        "#
    )
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    let mut initial = String::new();
    for kind in EntityKind::ALL {
        initial.push_str(&entity_table_sql(kind));
    }
    initial.push_str(&reference_table_sql(ReferenceKind::Germplasm));
    initial.push_str(
        r#"
        -- Durable operation queue, drained in seq order
        CREATE TABLE IF NOT EXISTS pending_operations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            target_uuid TEXT NOT NULL,
            entity TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('create', 'update', 'delete', 'media_append')),
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN ('queued', 'in_flight'))
        );

        CREATE INDEX IF NOT EXISTS idx_pending_enqueued ON pending_operations(enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_pending_target ON pending_operations(target_uuid);

        -- Per-record merge state
        CREATE TABLE IF NOT EXISTS crdt_state (
            uuid TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            state TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    );

    let mut history = String::from(
        r#"
        CREATE TABLE IF NOT EXISTS sync_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            pushed INTEGER NOT NULL DEFAULT 0,
            pulled INTEGER NOT NULL DEFAULT 0,
            outcome TEXT NOT NULL,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_history_started ON sync_history(started_at);
        "#,
    );
    history.push_str(&reference_table_sql(ReferenceKind::Trait));
    history.push_str(&reference_table_sql(ReferenceKind::Location));

    vec![
        Migration {
            version: 1,
            description: "Records, operation queue, merge state and metadata",
            up_sql: initial,
        },
        Migration {
            version: 2,
            description: "Sync history and trait/location reference caches",
            up_sql: history,
        },
    ]
}

/// Get current schema version from database
pub fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> StoreResult<i32> {
    let conn = pool.get()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> StoreResult<()> {
    let current_version = get_current_version(pool)?;
    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{} is newer than supported v{}",
            current_version, CURRENT_SCHEMA_VERSION
        )));
    }

    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;
    for migration in pending {
        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(&migration.up_sql).map_err(|e| {
            StoreError::Migration(format!("v{} ({}): {}", migration.version, migration.description, e))
        })?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, Timestamp::now().as_millis() as i64],
        )?;

        tx.commit()?;

        info!(version = migration.version, "Applied migration: {}", migration.description);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_pool() -> Pool<SqliteConnectionManager> {
        let manager = SqliteConnectionManager::memory();
        Pool::builder().max_size(1).build(manager).expect("Failed to create pool")
    }

    fn table_names(pool: &Pool<SqliteConnectionManager>) -> Vec<String> {
        let conn = pool.get().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap();
        names
    }

    #[test]
    fn test_initial_migration() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let tables = table_names(&pool);
        for expected in [
            "observations",
            "trials",
            "studies",
            "crosses",
            "pending_operations",
            "crdt_state",
            "sync_metadata",
            "sync_history",
            "germplasm_cache",
            "trait_cache",
            "location_cache",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
        }
    }

    #[test]
    fn test_migration_version_tracking() {
        let pool = setup_test_pool();
        assert_eq!(get_current_version(&pool).unwrap(), 0);

        migrate(&pool).unwrap();
        assert_eq!(get_current_version(&pool).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_idempotent() {
        let pool = setup_test_pool();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_latest_migration_matches_constant() {
        let latest = get_migrations().iter().map(|m| m.version).max().unwrap_or(0);
        assert_eq!(latest, CURRENT_SCHEMA_VERSION);
    }
}
