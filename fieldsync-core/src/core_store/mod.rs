/*
    core_store - Durable, mergeable state for field records

    The authoritative on-device state layer. Handles:
    - Data models (records, queued operations, reference rows, history)
    - CRDT merge of concurrent record versions
    - Local persistence of records, queue and merge state
*/

pub mod crdt;
pub mod model;
pub mod store;

#[cfg(test)]
pub mod tests;

// Re-export commonly used types
pub use crdt::{CrdtStateManager, MergeOutcome, RecordState, VectorClock};
pub use model::{
    EntityKind, FieldMap, OperationId, OperationKind, PendingOperation, Record, RecordId,
    ReferenceKind, ResolutionStrategy, Timestamp,
};
pub use store::{LocalStore, LocalStoreConfig, StoreError, StoreResult};
