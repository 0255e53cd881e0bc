//! Logging subsystem for fieldsync
//!
//! Structured events through `tracing`, rendered by `tracing-subscriber` to
//! stderr so command output on stdout stays machine-readable. `RUST_LOG`
//! takes precedence over the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// HTTP client internals are only interesting when explicitly asked for
const QUIET_TARGETS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The minimum log level to display
    pub level: LogLevel,
    /// Whether to include target module information
    pub with_target: bool,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with specified level
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` configuration section
    pub fn from_settings(settings: &LoggingConfig) -> Result<Self, LoggingError> {
        let level = LogLevel::from_str(&settings.level)
            .ok_or_else(|| LoggingError::InvalidLevel(settings.level.clone()))?;
        Ok(Self::new(level).json_format(settings.json))
    }

    /// Set whether to include target information
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Set whether to use JSON formatting
    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    /// Filter used when `RUST_LOG` is not set
    pub fn default_directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_string()];
        if self.level > LogLevel::Trace {
            directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
        }
        directives.join(",")
    }
}

/// Initialize the logging subsystem at the given level
pub fn init_logging(level: LogLevel) -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::new(level))
}

/// Initialize the logging subsystem with custom configuration
///
/// # Example
/// ```
/// use fieldsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug).with_target(false);
///
/// init_logging_with_config(config).expect("Failed to initialize logging");
/// ```
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let fmt_layer = fmt::layer()
        .with_target(config.with_target)
        .with_writer(std::io::stderr);

    if config.json_format {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(matches!(config.level, LogLevel::Info));
        assert!(config.with_target);
        assert!(!config.json_format);
    }

    #[test]
    fn test_from_settings() {
        let settings = LoggingConfig {
            level: "warning".to_string(),
            json: true,
        };
        let config = LogConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert!(config.json_format);

        let bad = LoggingConfig {
            level: "chatty".to_string(),
            json: false,
        };
        assert!(matches!(
            LogConfig::from_settings(&bad),
            Err(LoggingError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_default_directives_quiet_transport() {
        let info = LogConfig::new(LogLevel::Info).default_directives();
        assert!(info.starts_with("info,"));
        assert!(info.contains("reqwest=warn"));

        assert_eq!(LogConfig::new(LogLevel::Trace).default_directives(), "trace");
    }
}
