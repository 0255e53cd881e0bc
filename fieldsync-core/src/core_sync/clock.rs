//! Time source for the sync engine

use crate::core_store::model::Timestamp;

/// Wall-clock source; used for timestamps and pull cursors, never for merge order
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
