/*
    reference.rs - Reference cache rows and sync history entries
*/

use super::types::{ReferenceKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// One row of a reference cache (germplasm, traits, locations)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRecord {
    pub server_id: String,
    pub name: Option<String>,
    /// Full object as returned by the remote
    pub data: Value,
}

impl ReferenceRecord {
    /// Extract a cache row from a remote object
    ///
    /// Accepts `id`, `serverId` or `<kind>DbId` as the key and `name` or
    /// `<kind>Name` as the display name.
    pub fn from_json(kind: ReferenceKind, value: Value) -> Option<Self> {
        let db_id = format!("{}DbId", kind.as_str());
        let name_key = format!("{}Name", kind.as_str());

        let server_id = ["id", "serverId", db_id.as_str()]
            .iter()
            .find_map(|key| match value.get(*key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })?;
        let name = ["name", name_key.as_str()]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string));

        Some(ReferenceRecord {
            server_id,
            name,
            data: value,
        })
    }
}

/// Which cycle produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Push,
    Pull,
    Full,
    Startup,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Push => "push",
            CycleKind::Pull => "pull",
            CycleKind::Full => "full",
            CycleKind::Startup => "startup",
        }
    }
}

impl FromStr for CycleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(CycleKind::Push),
            "pull" => Ok(CycleKind::Pull),
            "full" => Ok(CycleKind::Full),
            "startup" => Ok(CycleKind::Startup),
            other => Err(format!("unknown cycle kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Ok,
    /// Some operations failed and stay queued
    Partial,
    AuthFailed,
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Ok => "ok",
            CycleOutcome::Partial => "partial",
            CycleOutcome::AuthFailed => "auth_failed",
            CycleOutcome::Failed => "failed",
        }
    }
}

impl FromStr for CycleOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(CycleOutcome::Ok),
            "partial" => Ok(CycleOutcome::Partial),
            "auth_failed" => Ok(CycleOutcome::AuthFailed),
            "failed" => Ok(CycleOutcome::Failed),
            other => Err(format!("unknown cycle outcome '{}'", other)),
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed sync cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub id: Option<i64>,
    pub kind: CycleKind,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub pushed: u32,
    pub pulled: u32,
    pub outcome: CycleOutcome,
    pub error: Option<String>,
}
