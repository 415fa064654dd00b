// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - the seams to the external
// collaborators (archive index, storage back-ends, archive codec, change
// log, scripts, mounts). Business logic belongs in domains/ and the kernel
// services.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ArchiveType;
use crate::domains::index::model::{
    AggregateInfo, EntityRecord, EntryFragment, EntryRecord, HistoryRow, IndexMode, IndexState,
    StorageRecord,
};
use crate::domains::job::model::{CryptSettings, ExcludePattern, IncludeEntry, ScheduleAggregate};
use crate::domains::job::running::{ProgressCounters, VolumeResult};

// =============================================================================
// Index (archive index database)
// =============================================================================

/// Opaque handle to an index session. Long-running queries on a handle can
/// be interrupted from another task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexHandle(pub u64);

/// New-entity parameters.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub uuid: Uuid,
    pub job_uuid: Uuid,
    pub schedule_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub archive_type: ArchiveType,
}

/// New-storage parameters.
#[derive(Debug, Clone)]
pub struct NewStorage {
    pub entity_id: Option<i64>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub index_state: IndexState,
    pub index_mode: IndexMode,
}

/// New-history parameters.
#[derive(Debug, Clone)]
pub struct NewHistory {
    pub job_uuid: Uuid,
    pub schedule_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub error_code: u32,
    pub error_data: String,
    pub duration_seconds: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
}

/// Storage row filter.
#[derive(Debug, Clone, Default)]
pub struct StorageFilter {
    pub entity_id: Option<i64>,
    pub index_state: Option<IndexState>,
    pub index_mode: Option<IndexMode>,
    pub name_contains: Option<String>,
}

/// The archive index: a transactional store with typed queries.
///
/// The core never holds the job-list lock while calling into this trait.
#[async_trait]
pub trait Index: Send + Sync {
    /// Whether the index reported successful initialization.
    fn is_initialized(&self) -> bool;

    async fn open_handle(&self) -> ServerResult<IndexHandle>;
    async fn close_handle(&self, handle: IndexHandle);

    /// Interrupt queries running on a handle; they return `Interrupted`.
    fn interrupt(&self, handle: &IndexHandle);

    // --- entities ---

    /// All entities ordered descending by creation time.
    async fn entities(&self, handle: &IndexHandle) -> ServerResult<Vec<EntityRecord>>;
    async fn entity_by_id(
        &self,
        handle: &IndexHandle,
        id: i64,
    ) -> ServerResult<Option<EntityRecord>>;
    async fn add_entity(&self, handle: &IndexHandle, entity: NewEntity) -> ServerResult<i64>;
    async fn update_entity_totals(
        &self,
        handle: &IndexHandle,
        id: i64,
        total_entry_count: u64,
        total_entry_size: u64,
    ) -> ServerResult<()>;
    async fn delete_entity(&self, handle: &IndexHandle, id: i64) -> ServerResult<()>;
    async fn set_entity_locked(
        &self,
        handle: &IndexHandle,
        id: i64,
        locked: bool,
    ) -> ServerResult<()>;

    /// Move all entries of one entity to another (`indexAssign`).
    async fn assign_entity(
        &self,
        handle: &IndexHandle,
        from_entity_id: i64,
        to_entity_id: i64,
        to_job_uuid: Option<Uuid>,
    ) -> ServerResult<()>;

    /// Distinct job UUIDs present in the index.
    async fn job_uuids(&self, handle: &IndexHandle) -> ServerResult<Vec<Uuid>>;

    // --- storages ---

    async fn storages(
        &self,
        handle: &IndexHandle,
        filter: StorageFilter,
    ) -> ServerResult<Vec<StorageRecord>>;
    async fn storage_by_id(
        &self,
        handle: &IndexHandle,
        id: i64,
    ) -> ServerResult<Option<StorageRecord>>;
    async fn storage_by_name(
        &self,
        handle: &IndexHandle,
        name: &str,
    ) -> ServerResult<Option<StorageRecord>>;
    async fn add_storage(&self, handle: &IndexHandle, storage: NewStorage) -> ServerResult<i64>;
    async fn update_storage(
        &self,
        handle: &IndexHandle,
        record: &StorageRecord,
    ) -> ServerResult<()>;
    async fn delete_storage(&self, handle: &IndexHandle, id: i64) -> ServerResult<()>;

    /// Next storage waiting for an index update.
    async fn next_update_requested(
        &self,
        handle: &IndexHandle,
    ) -> ServerResult<Option<StorageRecord>>;

    // --- entries ---

    async fn entries(
        &self,
        handle: &IndexHandle,
        storage_id: Option<i64>,
        name_filter: Option<&str>,
    ) -> ServerResult<Vec<EntryRecord>>;
    async fn entry_by_id(
        &self,
        handle: &IndexHandle,
        id: i64,
    ) -> ServerResult<Option<EntryRecord>>;
    async fn add_entry(&self, handle: &IndexHandle, entry: EntryRecord) -> ServerResult<i64>;
    async fn delete_entry(&self, handle: &IndexHandle, id: i64) -> ServerResult<()>;
    async fn entry_fragments(
        &self,
        handle: &IndexHandle,
        entry_id: i64,
    ) -> ServerResult<Vec<EntryFragment>>;

    // --- history & aggregates ---

    async fn add_history(&self, handle: &IndexHandle, row: NewHistory) -> ServerResult<i64>;
    async fn history(
        &self,
        handle: &IndexHandle,
        job_uuid: Option<Uuid>,
    ) -> ServerResult<Vec<HistoryRow>>;

    async fn aggregate_for_job(
        &self,
        handle: &IndexHandle,
        job_uuid: Uuid,
    ) -> ServerResult<AggregateInfo>;
    async fn aggregate_for_schedule(
        &self,
        handle: &IndexHandle,
        job_uuid: Uuid,
        schedule_uuid: Uuid,
    ) -> ServerResult<ScheduleAggregate>;
}

// =============================================================================
// Storage (archive artifact back-ends)
// =============================================================================

/// Parsed storage name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSpecifier {
    pub scheme: String,
    pub host: String,
    pub user: Option<String>,
    pub path: String,
}

impl StorageSpecifier {
    /// Parse `scheme://[user@]host/path` or a bare filesystem path.
    pub fn parse(name: &str) -> ServerResult<Self> {
        if name.is_empty() {
            return Err(ServerError::InvalidValue {
                name: "storageName".to_string(),
                value: name.to_string(),
            });
        }

        let Some((scheme, rest)) = name.split_once("://") else {
            return Ok(Self {
                scheme: "file".to_string(),
                host: String::new(),
                user: None,
                path: name.to_string(),
            });
        };
        if scheme.is_empty() || rest.is_empty() {
            return Err(ServerError::InvalidValue {
                name: "storageName".to_string(),
                value: name.to_string(),
            });
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (user, host) = match authority.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, authority.to_string()),
        };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host,
            user,
            path: format!("/{path}"),
        })
    }

    /// The directory part of the URI, macros intact.
    pub fn directory(&self) -> String {
        let dir = match self.path.rfind('/') {
            Some(0) => "/",
            Some(index) => &self.path[..index],
            None => "",
        };
        if self.scheme == "file" && self.host.is_empty() {
            dir.to_string()
        } else {
            let user = self
                .user
                .as_ref()
                .map(|u| format!("{u}@"))
                .unwrap_or_default();
            format!("{}://{}{}{}", self.scheme, user, self.host, dir)
        }
    }
}

/// Directory listing element.
#[derive(Debug, Clone)]
pub struct StorageFileInfo {
    pub name: String,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Credentials tried when initializing a storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageCredentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Archive artifact back-end.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Verify the storage is reachable with the given credentials.
    async fn init(
        &self,
        specifier: &StorageSpecifier,
        credentials: &StorageCredentials,
    ) -> ServerResult<()>;

    async fn exists(&self, uri: &str) -> ServerResult<bool>;
    async fn list(&self, dir_uri: &str) -> ServerResult<Vec<StorageFileInfo>>;
    async fn delete(&self, uri: &str) -> ServerResult<()>;
    async fn copy(&self, from_uri: &str, to_uri: &str) -> ServerResult<()>;

    /// Open and read an archive far enough to prove it is intact.
    async fn read_test(&self, uri: &str, crypt_password: Option<&str>) -> ServerResult<()>;
}

// =============================================================================
// Archiver (create/restore collaborators)
// =============================================================================

/// Inputs of a create run.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub job_uuid: Uuid,
    pub entity_uuid: Uuid,
    pub archive_type: ArchiveType,
    pub storage_name: String,
    pub includes: Vec<IncludeEntry>,
    pub excludes: Vec<ExcludePattern>,
    pub crypt: CryptSettings,
    pub custom_text: String,
    pub dry_run: bool,
    pub no_storage: bool,
}

/// Outcome of a create run.
#[derive(Debug, Clone, Default)]
pub struct CreateSummary {
    pub total_entry_count: u64,
    pub total_entry_size: u64,
    pub storage_size: u64,
    pub storage_names: Vec<String>,
}

/// Inputs of a restore run.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub storage_names: Vec<String>,
    pub entry_names: Vec<String>,
    pub destination: String,
    pub directory_content: bool,
}

/// Callbacks the create/restore collaborators consult while running.
#[async_trait]
pub trait RunEvents: Send + Sync {
    fn crypt_password(&self) -> Option<String>;
    fn progress(&self, progress: ProgressCounters, current_entry: &str);

    /// Ask the operator for a volume; blocks until answered or aborted.
    async fn request_volume(&self, volume_number: u32, message: &str) -> VolumeResult;

    fn is_pause_create(&self) -> bool;
    fn is_pause_storage(&self) -> bool;
    fn is_pause_restore(&self) -> bool;
    fn is_aborted(&self) -> bool;
}

/// The archive codec.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn create(
        &self,
        request: CreateRequest,
        events: std::sync::Arc<dyn RunEvents>,
    ) -> ServerResult<CreateSummary>;

    async fn restore(
        &self,
        request: RestoreRequest,
        events: std::sync::Arc<dyn RunEvents>,
    ) -> ServerResult<()>;
}

// =============================================================================
// Continuous change log
// =============================================================================

/// Pending-change query for continuous schedules.
pub trait ContinuousLog: Send + Sync {
    fn has_pending(&self, job_uuid: Uuid, schedule_uuid: Uuid) -> bool;

    /// Mark the pending entries of a schedule as consumed by a run.
    fn consume(&self, job_uuid: Uuid, schedule_uuid: Uuid);
}

// =============================================================================
// Scripts & mounts
// =============================================================================

/// Pre/post script execution with text macros.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &str, macros: &HashMap<String, String>) -> ServerResult<()>;
}

/// Mounting of job mount-list devices.
#[async_trait]
pub trait MountManager: Send + Sync {
    async fn mount(&self, name: &str, device: &str) -> ServerResult<()>;
    async fn unmount(&self, name: &str) -> ServerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specifier_parses_full_uri() {
        let spec = StorageSpecifier::parse("sftp://backup@host.example.org/archive/job.bar")
            .unwrap();
        assert_eq!(spec.scheme, "sftp");
        assert_eq!(spec.user.as_deref(), Some("backup"));
        assert_eq!(spec.host, "host.example.org");
        assert_eq!(spec.path, "/archive/job.bar");
    }

    #[test]
    fn test_specifier_parses_bare_path() {
        let spec = StorageSpecifier::parse("/var/backups/job.bar").unwrap();
        assert_eq!(spec.scheme, "file");
        assert!(spec.host.is_empty());
        assert_eq!(spec.path, "/var/backups/job.bar");
    }

    #[test]
    fn test_specifier_rejects_empty_and_malformed() {
        assert!(StorageSpecifier::parse("").is_err());
        assert!(StorageSpecifier::parse("://host/x").is_err());
        assert!(StorageSpecifier::parse("ftp://").is_err());
    }

    #[test]
    fn test_specifier_directory() {
        let spec = StorageSpecifier::parse("ftp://u@h/backup/daily/job.bar").unwrap();
        assert_eq!(spec.directory(), "ftp://u@h/backup/daily");

        let local = StorageSpecifier::parse("/var/backups/job.bar").unwrap();
        assert_eq!(local.directory(), "/var/backups");
    }
}
