/*
    errors.rs - Error types for the local store

    Local storage failures are fatal to the triggering call and always
    propagate; nothing in this layer swallows a failed write.
*/

use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite reported a failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database locked by another writer
    #[error("Storage busy: {0}")]
    Busy(String),

    /// Could not obtain a pooled connection
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller supplied something the store cannot apply
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal invariant broken
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::Pool(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Busy(err.to_string())
            }
            other => StoreError::Storage(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        let err = StoreError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(matches!(err, StoreError::Busy(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_storage_failure_not_retryable() {
        let err = StoreError::from(rusqlite::Error::InvalidQuery);
        assert!(matches!(err, StoreError::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound("observation abc".to_string());
        assert_eq!(err.to_string(), "Not found: observation abc");
    }
}
