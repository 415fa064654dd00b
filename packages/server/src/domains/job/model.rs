//! Job model: the persistent backup specification plus its transient run
//! state.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::persistence::PersistenceList;
use super::running::{JobState, RunningInfo};
use super::schedule::Schedule;
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::{ArchiveType, SlaveState, TlsMode};
use crate::domains::index::model::AggregateInfo;

// ============================================================================
// Sub-list entries
// ============================================================================

/// What an include entry selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryType {
    #[default]
    File,
    Image,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::File => write!(f, "FILE"),
            EntryType::Image => write!(f, "IMAGE"),
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(EntryType::File),
            "IMAGE" => Ok(EntryType::Image),
            other => Err(format!("unknown entry type '{other}'")),
        }
    }
}

/// How a pattern string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PatternType {
    #[default]
    Glob,
    RegularExpression,
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternType::Glob => write!(f, "GLOB"),
            PatternType::RegularExpression => write!(f, "REGEX"),
        }
    }
}

impl FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GLOB" => Ok(PatternType::Glob),
            "REGEX" => Ok(PatternType::RegularExpression),
            other => Err(format!("unknown pattern type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludeEntry {
    pub id: u32,
    pub entry_type: EntryType,
    pub pattern_type: PatternType,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludePattern {
    pub id: u32,
    pub pattern_type: PatternType,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub id: u32,
    pub name: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSource {
    pub id: u32,
    pub storage_name: String,
}

// ============================================================================
// Options
// ============================================================================

/// Crypt settings of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CryptSettings {
    pub algorithm: String,
    pub password: Option<String>,
    pub public_key: Option<String>,
}

/// Binding of a job to a remote slave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveBinding {
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
}

/// Request parameters recorded when a job is triggered, consumed by the
/// runner when it picks the job up.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub archive_type: ArchiveType,
    pub schedule_uuid: Option<Uuid>,
    pub custom_text: String,
    pub test_created: bool,
    pub no_storage: bool,
    pub dry_run: bool,
    pub due_at: DateTime<Utc>,
    pub actor: String,
}

/// Per-schedule aggregate statistics loaded from the index.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScheduleAggregate {
    pub total_entity_count: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
}

// ============================================================================
// Job
// ============================================================================

/// A user-defined backup specification identified by a stable UUID.
#[derive(Debug, Clone)]
pub struct Job {
    pub uuid: Uuid,
    pub name: String,
    /// Storage destination template, e.g. `sftp://host/backup/%name-%type.bar`.
    pub storage_name: String,
    pub comment: String,

    pub includes: Vec<IncludeEntry>,
    pub excludes: Vec<ExcludePattern>,
    pub compress_excludes: Vec<ExcludePattern>,
    pub mounts: Vec<Mount>,
    pub delta_sources: Vec<DeltaSource>,
    pub schedules: Vec<Schedule>,
    pub persistence: PersistenceList,

    pub crypt: CryptSettings,
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    pub slave: Option<SlaveBinding>,

    // Transient run state.
    pub running_info: RunningInfo,
    pub start_request: Option<StartRequest>,
    pub slave_state: SlaveState,
    pub last_schedule_check: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
    pub last_error_code: u32,
    pub last_error_message: String,
    pub aggregate: AggregateInfo,
    pub schedule_aggregates: HashMap<Uuid, ScheduleAggregate>,

    /// Set on every mutation; the scheduler flushes modified jobs to disk.
    pub modified: bool,

    next_entry_id: u32,
}

impl Job {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            storage_name: String::new(),
            comment: String::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
            compress_excludes: Vec::new(),
            mounts: Vec::new(),
            delta_sources: Vec::new(),
            schedules: Vec::new(),
            persistence: PersistenceList::new(),
            crypt: CryptSettings::default(),
            pre_command: None,
            post_command: None,
            slave: None,
            running_info: RunningInfo::new(),
            start_request: None,
            slave_state: SlaveState::Offline,
            last_schedule_check: now,
            last_executed: None,
            last_error_code: 0,
            last_error_message: String::new(),
            aggregate: AggregateInfo::default(),
            schedule_aggregates: HashMap::new(),
            modified: false,
            next_entry_id: 0,
        }
    }

    /// Whether this job executes on a remote slave.
    pub fn is_remote(&self) -> bool {
        self.slave.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.running_info.state.is_active()
    }

    /// Next stable id for a sub-list entry.
    pub fn next_entry_id(&mut self) -> u32 {
        self.next_entry_id += 1;
        self.next_entry_id
    }

    /// Bump the id counter past ids loaded from the job file.
    pub fn observe_entry_id(&mut self, id: u32) {
        self.next_entry_id = self.next_entry_id.max(id);
    }

    /// Trigger a run. No-op when the job is already active.
    pub fn trigger(&mut self, request: StartRequest) -> bool {
        if self.is_active() {
            return false;
        }
        self.running_info.reset();
        self.running_info.state = JobState::Waiting;
        self.start_request = Some(request);
        true
    }

    /// Request an abort of the current run.
    pub fn request_abort(&mut self, actor: impl Into<String>) {
        self.running_info
            .requested_abort
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.running_info.abort_actor = actor.into();
    }

    pub fn schedule(&self, uuid: Uuid) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.uuid == uuid)
    }

    pub fn schedule_mut(&mut self, uuid: Uuid) -> Option<&mut Schedule> {
        self.schedules.iter_mut().find(|s| s.uuid == uuid)
    }

    // ------------------------------------------------------------------
    // Option table for jobOptionGet/Set/Delete
    // ------------------------------------------------------------------

    pub fn option_get(&self, name: &str) -> ServerResult<String> {
        let value = match name {
            "archive-name" => self.storage_name.clone(),
            "comment" => self.comment.clone(),
            "crypt-algorithm" => self.crypt.algorithm.clone(),
            "crypt-password" => self.crypt.password.clone().unwrap_or_default(),
            "crypt-public-key" => self.crypt.public_key.clone().unwrap_or_default(),
            "pre-command" => self.pre_command.clone().unwrap_or_default(),
            "post-command" => self.post_command.clone().unwrap_or_default(),
            "slave-host-name" => self
                .slave
                .as_ref()
                .map(|s| s.host.clone())
                .unwrap_or_default(),
            "slave-host-port" => self
                .slave
                .as_ref()
                .map(|s| s.port.to_string())
                .unwrap_or_else(|| "0".to_string()),
            "slave-tls-mode" => self
                .slave
                .as_ref()
                .map(|s| s.tls_mode.to_string())
                .unwrap_or_else(|| TlsMode::None.to_string()),
            "mount-device" => {
                return Err(ServerError::DeprecatedOrIgnoredValue(name.to_string()))
            }
            _ => return Err(ServerError::UnknownValue(name.to_string())),
        };
        Ok(value)
    }

    pub fn option_set(&mut self, name: &str, value: &str) -> ServerResult<()> {
        match name {
            "archive-name" => self.storage_name = value.to_string(),
            "comment" => self.comment = value.to_string(),
            "crypt-algorithm" => self.crypt.algorithm = value.to_string(),
            "crypt-password" => {
                self.crypt.password = (!value.is_empty()).then(|| value.to_string())
            }
            "crypt-public-key" => {
                self.crypt.public_key = (!value.is_empty()).then(|| value.to_string())
            }
            "pre-command" => self.pre_command = (!value.is_empty()).then(|| value.to_string()),
            "post-command" => self.post_command = (!value.is_empty()).then(|| value.to_string()),
            "slave-host-name" => {
                if value.is_empty() {
                    self.slave = None;
                } else {
                    let binding = self.slave.get_or_insert(SlaveBinding {
                        host: String::new(),
                        port: DEFAULT_SLAVE_PORT,
                        tls_mode: TlsMode::Try,
                    });
                    binding.host = value.to_string();
                }
            }
            "slave-host-port" => {
                let port: u16 = value.parse().map_err(|_| ServerError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
                if let Some(binding) = &mut self.slave {
                    binding.port = port;
                }
            }
            "slave-tls-mode" => {
                let tls_mode: TlsMode = value.parse().map_err(|_| ServerError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
                if let Some(binding) = &mut self.slave {
                    binding.tls_mode = tls_mode;
                }
            }
            "mount-device" => {
                return Err(ServerError::DeprecatedOrIgnoredValue(name.to_string()))
            }
            _ => return Err(ServerError::UnknownValue(name.to_string())),
        }
        self.modified = true;
        Ok(())
    }

    /// Reset an option to its default.
    pub fn option_delete(&mut self, name: &str) -> ServerResult<()> {
        match name {
            "archive-name" => self.storage_name.clear(),
            "comment" => self.comment.clear(),
            "crypt-algorithm" => self.crypt.algorithm.clear(),
            "crypt-password" => self.crypt.password = None,
            "crypt-public-key" => self.crypt.public_key = None,
            "pre-command" => self.pre_command = None,
            "post-command" => self.post_command = None,
            "slave-host-name" | "slave-host-port" | "slave-tls-mode" => self.slave = None,
            _ => return Err(ServerError::UnknownValue(name.to_string())),
        }
        self.modified = true;
        Ok(())
    }
}

pub const DEFAULT_SLAVE_PORT: u16 = 38523;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn request() -> StartRequest {
        StartRequest {
            archive_type: ArchiveType::Full,
            schedule_uuid: None,
            custom_text: String::new(),
            test_created: false,
            no_storage: false,
            dry_run: false,
            due_at: now(),
            actor: "test".to_string(),
        }
    }

    #[test]
    fn test_trigger_rejects_active_job() {
        let mut job = Job::new("backup-home", now());
        assert!(job.trigger(request()));
        assert_eq!(job.running_info.state, JobState::Waiting);
        // A second trigger while waiting is refused.
        assert!(!job.trigger(request()));
    }

    #[test]
    fn test_option_round_trip() {
        let mut job = Job::new("j", now());
        job.option_set("archive-name", "ftp://host/backup-%type.bar")
            .unwrap();
        assert_eq!(
            job.option_get("archive-name").unwrap(),
            "ftp://host/backup-%type.bar"
        );
        assert!(job.modified);
    }

    #[test]
    fn test_option_unknown_name() {
        let job = Job::new("j", now());
        assert!(matches!(
            job.option_get("no-such-option"),
            Err(ServerError::UnknownValue(_))
        ));
    }

    #[test]
    fn test_option_deprecated_name() {
        let mut job = Job::new("j", now());
        assert!(matches!(
            job.option_set("mount-device", "/dev/sdb1"),
            Err(ServerError::DeprecatedOrIgnoredValue(_))
        ));
    }

    #[test]
    fn test_slave_binding_via_options() {
        let mut job = Job::new("j", now());
        assert!(!job.is_remote());

        job.option_set("slave-host-name", "slave1.example.org").unwrap();
        job.option_set("slave-host-port", "40000").unwrap();
        job.option_set("slave-tls-mode", "FORCE").unwrap();

        let binding = job.slave.as_ref().unwrap();
        assert_eq!(binding.host, "slave1.example.org");
        assert_eq!(binding.port, 40000);
        assert_eq!(binding.tls_mode, TlsMode::Force);
        assert!(job.is_remote());

        job.option_delete("slave-host-name").unwrap();
        assert!(!job.is_remote());
    }

    #[test]
    fn test_entry_ids_are_stable_and_unique() {
        let mut job = Job::new("j", now());
        let a = job.next_entry_id();
        let b = job.next_entry_id();
        assert_ne!(a, b);

        job.observe_entry_id(100);
        assert_eq!(job.next_entry_id(), 101);
    }
}
