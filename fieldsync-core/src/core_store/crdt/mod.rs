/*
    CRDT subsystem - Merge rules for field records

    Vector-clock ordered field registers, a grow-only media log, and the
    per-record state and manager built from them.
*/

pub mod field_register;
pub mod manager;
pub mod media_log;
pub mod record_state;
pub mod traits;
pub mod vector_clock;

pub use field_register::{FieldRegister, Version};
pub use manager::{CrdtStateManager, MergeOutcome};
pub use media_log::{MediaEntry, MediaLog};
pub use record_state::{RecordOperation, RecordState, RemoteSnapshot};
pub use traits::Crdt;
pub use vector_clock::{ClockOrdering, NodeId, VectorClock, SERVER_ORIGIN};
