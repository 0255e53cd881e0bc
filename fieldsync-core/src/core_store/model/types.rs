/*
    types.rs - Common types for the record model

    Defines:
    - Timestamps (wall clock, display and differential pull only)
    - Record identifiers
    - Entity and reference kinds with their tables and remote collections
*/

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp representing the current time
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis().max(0) as u64)
    }

    /// Create a timestamp from milliseconds since epoch
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Get milliseconds since epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_millis().max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0 as i64)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// ISO8601 form used for `changedSince`
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// Client-generated stable record identifier
///
/// Assigned before any server identifier exists and never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        RecordId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(s)
    }
}

/// Record kinds managed through the merge engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Observation,
    Trial,
    Study,
    Cross,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Observation,
        EntityKind::Trial,
        EntityKind::Study,
        EntityKind::Cross,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Observation => "observation",
            EntityKind::Trial => "trial",
            EntityKind::Study => "study",
            EntityKind::Cross => "cross",
        }
    }

    /// Local table holding the materialized records
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Observation => "observations",
            EntityKind::Trial => "trials",
            EntityKind::Study => "studies",
            EntityKind::Cross => "crosses",
        }
    }

    /// Remote collection path segment
    pub fn collection(&self) -> &'static str {
        self.table()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "observation" | "observations" => Ok(EntityKind::Observation),
            "trial" | "trials" => Ok(EntityKind::Trial),
            "study" | "studies" => Ok(EntityKind::Study),
            "cross" | "crosses" => Ok(EntityKind::Cross),
            other => Err(format!("unknown entity kind '{}'", other)),
        }
    }
}

/// Read-mostly lookup data refreshed wholesale on every pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Germplasm,
    Trait,
    Location,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] =
        [ReferenceKind::Germplasm, ReferenceKind::Trait, ReferenceKind::Location];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Germplasm => "germplasm",
            ReferenceKind::Trait => "trait",
            ReferenceKind::Location => "location",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            ReferenceKind::Germplasm => "germplasm_cache",
            ReferenceKind::Trait => "trait_cache",
            ReferenceKind::Location => "location_cache",
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            ReferenceKind::Germplasm => "germplasm",
            ReferenceKind::Trait => "traits",
            ReferenceKind::Location => "locations",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "germplasm" => Ok(ReferenceKind::Germplasm),
            "trait" | "traits" => Ok(ReferenceKind::Trait),
            "location" | "locations" => Ok(ReferenceKind::Location),
            other => Err(format!("unknown reference kind '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:20.123Z");
        assert_eq!(Timestamp::from_datetime(ts.to_datetime()), ts);
    }

    #[test]
    fn test_record_id_generate_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("observations".parse::<EntityKind>(), Ok(EntityKind::Observation));
        assert_eq!("Study".parse::<EntityKind>(), Ok(EntityKind::Study));
        assert!("plot".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::Study.table(), "studies");
    }

    #[test]
    fn test_reference_kind_collections() {
        assert_eq!(ReferenceKind::Germplasm.collection(), "germplasm");
        assert_eq!(ReferenceKind::Trait.collection(), "traits");
        assert_eq!("locations".parse::<ReferenceKind>(), Ok(ReferenceKind::Location));
    }
}
