/*
    fieldsync-core - Offline-first sync for agricultural field records

    - core_store: records, merge state and the durable operation queue
    - core_sync: push/pull cycles against the remote API, status, supervisor
    - config, logging, metrics, shutdown: process plumbing shared with the CLI
*/

pub mod config;
pub mod core_store;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod shutdown;

#[cfg(test)]
pub mod test_utils;

pub use config::{Config, ConfigError, SyncConfig};
pub use core_store::{
    CrdtStateManager, EntityKind, LocalStore, Record, RecordId, ResolutionStrategy, StoreError,
};
pub use core_sync::{
    HttpRemote, NetworkState, RemoteApi, SyncEngine, SyncError, SyncReport, SyncStatus,
    SyncSupervisor,
};
pub use logging::{init_logging, LogLevel};
pub use shutdown::ShutdownCoordinator;
