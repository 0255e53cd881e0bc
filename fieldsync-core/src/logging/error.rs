//! Error types for the logging subsystem

use std::fmt;

/// Errors that can occur in the logging subsystem
#[derive(Debug, Clone)]
pub enum LoggingError {
    /// A global subscriber is already installed or could not be built
    InitializationFailed(String),
    /// Configured level name is not recognised
    InvalidLevel(String),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::InitializationFailed(msg) => {
                write!(f, "Failed to initialize logging: {}", msg)
            }
            LoggingError::InvalidLevel(level) => {
                write!(f, "Unknown log level '{}'", level)
            }
        }
    }
}

impl std::error::Error for LoggingError {}
