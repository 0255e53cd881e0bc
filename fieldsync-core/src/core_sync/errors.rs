/*
    errors.rs - Error types for the sync layer
*/

use super::remote::RemoteError;
use super::status::NetworkState;
use crate::core_store::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local storage failed; never retried automatically
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown resolution strategy '{0}'")]
    InvalidStrategy(String),

    #[error("Merge resolution requires merged fields")]
    MissingMergedFields,

    #[error("Record {0} has no conflict to resolve")]
    NoConflict(String),

    #[error("Network '{0}' is not eligible for sync")]
    NotEligible(NetworkState),
}

impl SyncError {
    /// Credential rejected or missing
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_auth())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
