//! Index record types.
//!
//! The index itself is an external collaborator; the core only holds
//! short-lived copies of these records or their ids.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::types::ArchiveType;

/// State of a storage index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexState {
    #[default]
    None,
    Ok,
    UpdateRequested,
    Update,
    Error,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IndexState::None => "NONE",
            IndexState::Ok => "OK",
            IndexState::UpdateRequested => "UPDATE_REQUESTED",
            IndexState::Update => "UPDATE",
            IndexState::Error => "ERROR",
        };
        write!(f, "{text}")
    }
}

impl FromStr for IndexState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(IndexState::None),
            "OK" => Ok(IndexState::Ok),
            "UPDATE_REQUESTED" => Ok(IndexState::UpdateRequested),
            "UPDATE" => Ok(IndexState::Update),
            "ERROR" => Ok(IndexState::Error),
            other => Err(format!("unknown index state '{other}'")),
        }
    }
}

/// Who maintains a storage index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IndexMode {
    #[default]
    Manual,
    Auto,
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMode::Manual => write!(f, "MANUAL"),
            IndexMode::Auto => write!(f, "AUTO"),
        }
    }
}

impl FromStr for IndexMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(IndexMode::Manual),
            "AUTO" => Ok(IndexMode::Auto),
            other => Err(format!("unknown index mode '{other}'")),
        }
    }
}

/// One executed backup run, owning N storages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub job_uuid: Uuid,
    pub schedule_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub archive_type: ArchiveType,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
    pub locked: bool,
}

/// One concrete archive artifact at a URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: i64,
    pub entity_id: Option<i64>,
    /// Full storage URI.
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub index_state: IndexState,
    pub index_mode: IndexMode,
    pub last_checked: Option<DateTime<Utc>>,
    pub error_message: String,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
}

/// One archived entry inside a storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: i64,
    pub storage_id: i64,
    pub name: String,
    pub entry_kind: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A fragment of an entry within a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFragment {
    pub entry_id: i64,
    pub offset: u64,
    pub size: u64,
}

/// One job-run history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: i64,
    pub job_uuid: Uuid,
    pub schedule_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub error_code: u32,
    pub error_data: String,
    pub duration_seconds: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
}

/// Per-archive-type totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TypeTotals {
    pub entity_count: u64,
    pub entry_count: u64,
    pub entry_size: u64,
}

/// Per-job aggregate statistics loaded from the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateInfo {
    pub per_type: HashMap<ArchiveType, TypeTotals>,
    pub last_executed: Option<DateTime<Utc>>,
    pub last_error_code: u32,
    pub last_error_message: String,
}

impl AggregateInfo {
    pub fn totals(&self, archive_type: ArchiveType) -> TypeTotals {
        self.per_type.get(&archive_type).copied().unwrap_or_default()
    }

    pub fn total_entity_count(&self) -> u64 {
        self.per_type.values().map(|t| t.entity_count).sum()
    }

    pub fn total_entry_size(&self) -> u64 {
        self.per_type.values().map(|t| t.entry_size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_state_round_trip() {
        for state in [
            IndexState::None,
            IndexState::Ok,
            IndexState::UpdateRequested,
            IndexState::Update,
            IndexState::Error,
        ] {
            assert_eq!(state.to_string().parse::<IndexState>().unwrap(), state);
        }
    }

    #[test]
    fn test_aggregate_totals() {
        let mut info = AggregateInfo::default();
        info.per_type.insert(
            ArchiveType::Full,
            TypeTotals {
                entity_count: 2,
                entry_count: 100,
                entry_size: 4096,
            },
        );
        info.per_type.insert(
            ArchiveType::Incremental,
            TypeTotals {
                entity_count: 5,
                entry_count: 10,
                entry_size: 512,
            },
        );

        assert_eq!(info.total_entity_count(), 7);
        assert_eq!(info.total_entry_size(), 4608);
        assert_eq!(info.totals(ArchiveType::Continuous).entity_count, 0);
    }
}
