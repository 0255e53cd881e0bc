/*
    status.rs - Derived, observable sync state

    Rebuilt from the store and queue after every state change and
    published through a watch channel. Never a source of truth.
*/

use crate::core_store::model::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connectivity as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Offline,
    /// Cellular or otherwise billed connection
    Metered,
    Unmetered,
}

impl NetworkState {
    pub fn is_online(&self) -> bool {
        !matches!(self, NetworkState::Offline)
    }

    /// Whether a cycle may use this connection
    pub fn allows_sync(&self, wifi_only: bool) -> bool {
        match self {
            NetworkState::Offline => false,
            NetworkState::Metered => !wifi_only,
            NetworkState::Unmetered => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkState::Offline => "offline",
            NetworkState::Metered => "metered",
            NetworkState::Unmetered => "unmetered",
        }
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" => Ok(NetworkState::Offline),
            "metered" | "cellular" => Ok(NetworkState::Metered),
            "unmetered" | "wifi" | "online" => Ok(NetworkState::Unmetered),
            other => Err(format!("unknown network state '{}'", other)),
        }
    }
}

/// Snapshot published to subscribers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<Timestamp>,
    pub pending_count: usize,
    pub last_error: Option<String>,
    pub conflict_count: usize,
}
