/*
    operation.rs - Durable intents waiting for remote acknowledgement

    State machine:
        queued -> in_flight -> acknowledged (row removed)
                            -> queued, retry_count + 1   (transport / server failure)
                            -> queued, unchanged count   (authorization failure, cycle halted)

    A row is only ever removed on acknowledgement or explicit operator discard.
*/

use super::types::{EntityKind, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a queued operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn generate() -> Self {
        OperationId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        OperationId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    MediaAppend,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::MediaAppend => "media_append",
        }
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "media_append" => Ok(OperationKind::MediaAppend),
            other => Err(format!("unknown operation kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    InFlight,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::InFlight => "in_flight",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "in_flight" {
            OperationStatus::InFlight
        } else {
            OperationStatus::Queued
        }
    }
}

/// Queued intent
///
/// The payload names what changed (field names, media path); the body sent
/// to the remote is rebuilt from the merge state at push time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    /// Enqueue sequence, assigned by the store
    pub seq: i64,
    pub target_uuid: RecordId,
    pub entity: EntityKind,
    pub kind: OperationKind,
    pub payload: Value,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: OperationStatus,
}

impl PendingOperation {
    pub fn new(
        target_uuid: RecordId,
        entity: EntityKind,
        kind: OperationKind,
        payload: Value,
        enqueued_at: Timestamp,
    ) -> Self {
        PendingOperation {
            id: OperationId::generate(),
            seq: 0,
            target_uuid,
            entity,
            kind,
            payload,
            enqueued_at,
            retry_count: 0,
            last_error: None,
            status: OperationStatus::Queued,
        }
    }

    /// Exhausted operations stay queued but are skipped by automatic cycles
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Field names carried in an update payload
    pub fn field_names(&self) -> Vec<String> {
        self.payload
            .get("fields")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Media path carried in a media-append payload
    pub fn media_path(&self) -> Option<&str> {
        self.payload.get("path").and_then(Value::as_str)
    }
}

/// Queue side effect committed together with a merge
#[derive(Debug, Clone, PartialEq)]
pub enum QueueChange {
    None,
    Enqueue(PendingOperation),
    Acknowledge(OperationId),
}
