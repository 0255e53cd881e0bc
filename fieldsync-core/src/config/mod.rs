//! Configuration management for fieldsync
//!
//! TOML file with per-section defaults, overridable from the environment
//! with `FIELDSYNC_<SECTION>_<KEY>` variables.

use crate::core_store::model::{EntityKind, ReferenceKind, ResolutionStrategy};
use crate::core_store::store::LocalStoreConfig;
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// On-device database
    pub store: LocalStoreConfig,

    /// Remote API endpoint and credentials
    pub remote: RemoteConfig,

    /// Sync cycle behaviour
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL the collection paths are appended to
    pub base_url: String,

    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Environment variable holding the bearer token
    pub token_env: String,
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background cycle period
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Push right after local writes when the network allows it
    pub auto_sync: bool,

    /// Run the periodic background cycle
    pub background_sync: bool,

    /// Treat metered connections as not eligible for sync
    pub wifi_only: bool,

    /// Failures after which an operation is skipped by automatic cycles
    pub max_retries: u32,

    /// Creates sent per bulk request
    pub push_batch_size: usize,

    pub reference_page_size: usize,

    /// Record kinds pushed and pulled
    pub entities: Vec<EntityKind>,

    /// Reference caches refreshed on pull
    pub reference_kinds: Vec<ReferenceKind>,

    /// Strategy applied to newly conflicted records after a pull; unset means manual review
    pub auto_resolve: Option<ResolutionStrategy>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/brapi/v2".to_string(),
            request_timeout: Duration::from_secs(30),
            token_env: "FIELDSYNC_TOKEN".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            auto_sync: true,
            background_sync: true,
            wifi_only: true,
            max_retries: 10,
            push_batch_size: 50,
            reference_page_size: 1000,
            entities: vec![EntityKind::Observation],
            reference_kinds: vec![ReferenceKind::Germplasm],
            auto_resolve: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::invalid(key, e))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::invalid(key, e))
}

fn parse_list<T>(key: &str, raw: &str) -> Result<Vec<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_value(key, item))
        .collect()
}

impl Config {
    /// Defaults overridden by environment variables
    ///
    /// Example: FIELDSYNC_SYNC_INTERVAL=5m
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// File (when given) then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FIELDSYNC_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store config
        if let Some(path) = lookup("FIELDSYNC_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("FIELDSYNC_STORE_POOL_SIZE") {
            self.store.pool_size = parse_value("FIELDSYNC_STORE_POOL_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_STORE_BUSY_TIMEOUT") {
            self.store.busy_timeout = parse_duration("FIELDSYNC_STORE_BUSY_TIMEOUT", &raw)?;
        }

        // Remote config
        if let Some(url) = lookup("FIELDSYNC_REMOTE_BASE_URL") {
            self.remote.base_url = url;
        }
        if let Some(raw) = lookup("FIELDSYNC_REMOTE_REQUEST_TIMEOUT") {
            self.remote.request_timeout =
                parse_duration("FIELDSYNC_REMOTE_REQUEST_TIMEOUT", &raw)?;
        }
        if let Some(var) = lookup("FIELDSYNC_REMOTE_TOKEN_ENV") {
            self.remote.token_env = var;
        }

        // Sync config
        if let Some(raw) = lookup("FIELDSYNC_SYNC_INTERVAL") {
            self.sync.interval = parse_duration("FIELDSYNC_SYNC_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_AUTO_SYNC") {
            self.sync.auto_sync = parse_value("FIELDSYNC_SYNC_AUTO_SYNC", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_BACKGROUND_SYNC") {
            self.sync.background_sync = parse_value("FIELDSYNC_SYNC_BACKGROUND_SYNC", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_WIFI_ONLY") {
            self.sync.wifi_only = parse_value("FIELDSYNC_SYNC_WIFI_ONLY", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_MAX_RETRIES") {
            self.sync.max_retries = parse_value("FIELDSYNC_SYNC_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_PUSH_BATCH_SIZE") {
            self.sync.push_batch_size = parse_value("FIELDSYNC_SYNC_PUSH_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_REFERENCE_PAGE_SIZE") {
            self.sync.reference_page_size =
                parse_value("FIELDSYNC_SYNC_REFERENCE_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_ENTITIES") {
            self.sync.entities = parse_list("FIELDSYNC_SYNC_ENTITIES", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_REFERENCE_KINDS") {
            self.sync.reference_kinds = parse_list("FIELDSYNC_SYNC_REFERENCE_KINDS", &raw)?;
        }
        if let Some(raw) = lookup("FIELDSYNC_SYNC_AUTO_RESOLVE") {
            self.sync.auto_resolve = match raw.trim().to_lowercase().as_str() {
                "" | "none" | "manual" => None,
                name => Some(parse_value("FIELDSYNC_SYNC_AUTO_RESOLVE", name)?),
            };
        }

        // Logging config
        if let Some(level) = lookup("FIELDSYNC_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(raw) = lookup("FIELDSYNC_LOG_JSON") {
            self.logging.json = parse_value("FIELDSYNC_LOG_JSON", &raw)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "store.pool_size must be greater than 0".to_string(),
            ));
        }

        if !(self.remote.base_url.starts_with("http://")
            || self.remote.base_url.starts_with("https://"))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "remote.base_url must be an http(s) URL: {}",
                self.remote.base_url
            )));
        }

        if self.sync.interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sync.interval must be greater than 0".to_string(),
            ));
        }
        if self.sync.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync.max_retries must be greater than 0".to_string(),
            ));
        }
        if self.sync.push_batch_size == 0 || self.sync.reference_page_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "sync batch and page sizes must be greater than 0".to_string(),
            ));
        }
        if self.sync.entities.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sync.entities must name at least one record kind".to_string(),
            ));
        }
        if self.sync.auto_resolve == Some(ResolutionStrategy::Merge) {
            return Err(ConfigError::ValidationFailed(
                "sync.auto_resolve cannot be 'merge'; merged fields need a reviewer".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        Ok(())
    }
}
