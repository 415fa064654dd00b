// In-memory capability implementations.
//
// MemoryIndex doubles as the default index backend when no external index
// is configured; the rest are simulation implementations used by tests and
// dry runs. Real back-ends plug in behind the same traits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::traits::{
    Archiver, ContinuousLog, CreateRequest, CreateSummary, Index, IndexHandle, MountManager,
    NewEntity, NewHistory, NewStorage, RestoreRequest, RunEvents, ScriptRunner, Storage,
    StorageCredentials, StorageFileInfo, StorageFilter, StorageSpecifier,
};
use crate::common::error::{ServerError, ServerResult};
use crate::domains::index::model::{
    AggregateInfo, EntityRecord, EntryFragment, EntryRecord, HistoryRow, StorageRecord, TypeTotals,
};
use crate::domains::job::model::ScheduleAggregate;
use crate::domains::job::running::{ProgressCounters, VolumeResult};

// =============================================================================
// MemoryIndex
// =============================================================================

#[derive(Default)]
struct IndexData {
    entities: Vec<EntityRecord>,
    storages: Vec<StorageRecord>,
    entries: Vec<EntryRecord>,
    fragments: Vec<EntryFragment>,
    history: Vec<HistoryRow>,
    next_entity_id: i64,
    next_storage_id: i64,
    next_entry_id: i64,
    next_history_id: i64,
}

/// In-memory archive index.
#[derive(Default)]
pub struct MemoryIndex {
    data: Mutex<IndexData>,
    interrupted: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn check_interrupted(&self, handle: &IndexHandle) -> ServerResult<()> {
        let mut interrupted = self.interrupted.lock().unwrap();
        if interrupted.remove(&handle.0) {
            Err(ServerError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Index for MemoryIndex {
    fn is_initialized(&self) -> bool {
        true
    }

    async fn open_handle(&self) -> ServerResult<IndexHandle> {
        Ok(IndexHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn close_handle(&self, handle: IndexHandle) {
        self.interrupted.lock().unwrap().remove(&handle.0);
    }

    fn interrupt(&self, handle: &IndexHandle) {
        self.interrupted.lock().unwrap().insert(handle.0);
    }

    async fn entities(&self, handle: &IndexHandle) -> ServerResult<Vec<EntityRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        let mut entities = data.entities.clone();
        entities.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entities)
    }

    async fn entity_by_id(
        &self,
        handle: &IndexHandle,
        id: i64,
    ) -> ServerResult<Option<EntityRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data.entities.iter().find(|e| e.id == id).cloned())
    }

    async fn add_entity(&self, handle: &IndexHandle, entity: NewEntity) -> ServerResult<i64> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        data.next_entity_id += 1;
        let id = data.next_entity_id;
        data.entities.push(EntityRecord {
            id,
            uuid: entity.uuid,
            job_uuid: entity.job_uuid,
            schedule_uuid: entity.schedule_uuid,
            created_at: entity.created_at,
            archive_type: entity.archive_type,
            total_entry_count: 0,
            total_entry_size: 0,
            locked: false,
        });
        Ok(id)
    }

    async fn update_entity_totals(
        &self,
        handle: &IndexHandle,
        id: i64,
        total_entry_count: u64,
        total_entry_size: u64,
    ) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        let entity = data
            .entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ServerError::DatabaseEntryNotFound(id.to_string()))?;
        entity.total_entry_count = total_entry_count;
        entity.total_entry_size = total_entry_size;
        Ok(())
    }

    async fn delete_entity(&self, handle: &IndexHandle, id: i64) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        let before = data.entities.len();
        data.entities.retain(|e| e.id != id);
        if data.entities.len() == before {
            return Err(ServerError::DatabaseEntryNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_entity_locked(
        &self,
        handle: &IndexHandle,
        id: i64,
        locked: bool,
    ) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        let entity = data
            .entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ServerError::DatabaseEntryNotFound(id.to_string()))?;
        entity.locked = locked;
        Ok(())
    }

    async fn assign_entity(
        &self,
        handle: &IndexHandle,
        from_entity_id: i64,
        to_entity_id: i64,
        to_job_uuid: Option<Uuid>,
    ) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        if !data.entities.iter().any(|e| e.id == to_entity_id) {
            return Err(ServerError::DatabaseEntryNotFound(to_entity_id.to_string()));
        }
        for storage in &mut data.storages {
            if storage.entity_id == Some(from_entity_id) {
                storage.entity_id = Some(to_entity_id);
            }
        }
        if let Some(job_uuid) = to_job_uuid {
            if let Some(entity) = data.entities.iter_mut().find(|e| e.id == to_entity_id) {
                entity.job_uuid = job_uuid;
            }
        }
        Ok(())
    }

    async fn job_uuids(&self, handle: &IndexHandle) -> ServerResult<Vec<Uuid>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        let mut uuids: Vec<Uuid> = data.entities.iter().map(|e| e.job_uuid).collect();
        uuids.sort();
        uuids.dedup();
        Ok(uuids)
    }

    async fn storages(
        &self,
        handle: &IndexHandle,
        filter: StorageFilter,
    ) -> ServerResult<Vec<StorageRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data
            .storages
            .iter()
            .filter(|s| filter.entity_id.is_none_or(|id| s.entity_id == Some(id)))
            .filter(|s| filter.index_state.is_none_or(|state| s.index_state == state))
            .filter(|s| filter.index_mode.is_none_or(|mode| s.index_mode == mode))
            .filter(|s| {
                filter
                    .name_contains
                    .as_ref()
                    .is_none_or(|text| s.name.contains(text.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn storage_by_id(
        &self,
        handle: &IndexHandle,
        id: i64,
    ) -> ServerResult<Option<StorageRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data.storages.iter().find(|s| s.id == id).cloned())
    }

    async fn storage_by_name(
        &self,
        handle: &IndexHandle,
        name: &str,
    ) -> ServerResult<Option<StorageRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data.storages.iter().find(|s| s.name == name).cloned())
    }

    async fn add_storage(&self, handle: &IndexHandle, storage: NewStorage) -> ServerResult<i64> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        data.next_storage_id += 1;
        let id = data.next_storage_id;
        data.storages.push(StorageRecord {
            id,
            entity_id: storage.entity_id,
            name: storage.name,
            created_at: storage.created_at,
            size: storage.size,
            index_state: storage.index_state,
            index_mode: storage.index_mode,
            last_checked: None,
            error_message: String::new(),
            total_entry_count: 0,
            total_entry_size: 0,
        });
        Ok(id)
    }

    async fn update_storage(
        &self,
        handle: &IndexHandle,
        record: &StorageRecord,
    ) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        let slot = data
            .storages
            .iter_mut()
            .find(|s| s.id == record.id)
            .ok_or_else(|| ServerError::DatabaseEntryNotFound(record.id.to_string()))?;
        *slot = record.clone();
        Ok(())
    }

    async fn delete_storage(&self, handle: &IndexHandle, id: i64) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        let before = data.storages.len();
        data.storages.retain(|s| s.id != id);
        if data.storages.len() == before {
            return Err(ServerError::DatabaseEntryNotFound(id.to_string()));
        }
        data.entries.retain(|e| e.storage_id != id);
        Ok(())
    }

    async fn next_update_requested(
        &self,
        handle: &IndexHandle,
    ) -> ServerResult<Option<StorageRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data
            .storages
            .iter()
            .find(|s| s.index_state == crate::domains::index::model::IndexState::UpdateRequested)
            .cloned())
    }

    async fn entries(
        &self,
        handle: &IndexHandle,
        storage_id: Option<i64>,
        name_filter: Option<&str>,
    ) -> ServerResult<Vec<EntryRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data
            .entries
            .iter()
            .filter(|e| storage_id.is_none_or(|id| e.storage_id == id))
            .filter(|e| name_filter.is_none_or(|text| e.name.contains(text)))
            .cloned()
            .collect())
    }

    async fn entry_by_id(
        &self,
        handle: &IndexHandle,
        id: i64,
    ) -> ServerResult<Option<EntryRecord>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data.entries.iter().find(|e| e.id == id).cloned())
    }

    async fn add_entry(&self, handle: &IndexHandle, mut entry: EntryRecord) -> ServerResult<i64> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        data.next_entry_id += 1;
        entry.id = data.next_entry_id;
        let id = entry.id;
        data.entries.push(entry);
        Ok(id)
    }

    async fn delete_entry(&self, handle: &IndexHandle, id: i64) -> ServerResult<()> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        let before = data.entries.len();
        data.entries.retain(|e| e.id != id);
        if data.entries.len() == before {
            return Err(ServerError::DatabaseEntryNotFound(id.to_string()));
        }
        data.fragments.retain(|f| f.entry_id != id);
        Ok(())
    }

    async fn entry_fragments(
        &self,
        handle: &IndexHandle,
        entry_id: i64,
    ) -> ServerResult<Vec<EntryFragment>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data
            .fragments
            .iter()
            .filter(|f| f.entry_id == entry_id)
            .copied()
            .collect())
    }

    async fn add_history(&self, handle: &IndexHandle, row: NewHistory) -> ServerResult<i64> {
        self.check_interrupted(handle)?;
        let mut data = self.data.lock().unwrap();
        data.next_history_id += 1;
        let id = data.next_history_id;
        data.history.push(HistoryRow {
            id,
            job_uuid: row.job_uuid,
            schedule_uuid: row.schedule_uuid,
            created_at: row.created_at,
            error_code: row.error_code,
            error_data: row.error_data,
            duration_seconds: row.duration_seconds,
            total_entry_count: row.total_entry_count,
            total_entry_size: row.total_entry_size,
        });
        Ok(id)
    }

    async fn history(
        &self,
        handle: &IndexHandle,
        job_uuid: Option<Uuid>,
    ) -> ServerResult<Vec<HistoryRow>> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();
        Ok(data
            .history
            .iter()
            .filter(|h| job_uuid.is_none_or(|uuid| h.job_uuid == uuid))
            .cloned()
            .collect())
    }

    async fn aggregate_for_job(
        &self,
        handle: &IndexHandle,
        job_uuid: Uuid,
    ) -> ServerResult<AggregateInfo> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();

        let mut info = AggregateInfo::default();
        for entity in data.entities.iter().filter(|e| e.job_uuid == job_uuid) {
            let totals = info
                .per_type
                .entry(entity.archive_type)
                .or_insert_with(TypeTotals::default);
            totals.entity_count += 1;
            totals.entry_count += entity.total_entry_count;
            totals.entry_size += entity.total_entry_size;
        }
        if let Some(last) = data
            .history
            .iter()
            .filter(|h| h.job_uuid == job_uuid)
            .max_by_key(|h| h.created_at)
        {
            info.last_executed = Some(last.created_at);
            info.last_error_code = last.error_code;
            info.last_error_message = last.error_data.clone();
        }
        Ok(info)
    }

    async fn aggregate_for_schedule(
        &self,
        handle: &IndexHandle,
        job_uuid: Uuid,
        schedule_uuid: Uuid,
    ) -> ServerResult<ScheduleAggregate> {
        self.check_interrupted(handle)?;
        let data = self.data.lock().unwrap();

        let mut aggregate = ScheduleAggregate::default();
        for entity in data
            .entities
            .iter()
            .filter(|e| e.job_uuid == job_uuid && e.schedule_uuid == Some(schedule_uuid))
        {
            aggregate.total_entity_count += 1;
            aggregate.total_entry_count += entity.total_entry_count;
            aggregate.total_entry_size += entity.total_entry_size;
        }
        Ok(aggregate)
    }
}

// =============================================================================
// MemoryStorage
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryFile {
    size: u64,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// In-memory storage back-end keyed by full URI.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, MemoryFile>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Seed a file, for tests and the simulated archiver.
    pub fn put_file(&self, uri: &str, size: u64, at: DateTime<Utc>) {
        self.files.lock().unwrap().insert(
            uri.to_string(),
            MemoryFile {
                size,
                created_at: at,
                modified_at: at,
            },
        );
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    fn parent(uri: &str) -> &str {
        match uri.rfind('/') {
            Some(index) => &uri[..index],
            None => "",
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(
        &self,
        _specifier: &StorageSpecifier,
        _credentials: &StorageCredentials,
    ) -> ServerResult<()> {
        Ok(())
    }

    async fn exists(&self, uri: &str) -> ServerResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(uri))
    }

    async fn list(&self, dir_uri: &str) -> ServerResult<Vec<StorageFileInfo>> {
        let dir = dir_uri.trim_end_matches('/');
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|(uri, _)| Self::parent(uri) == dir)
            .map(|(uri, file)| StorageFileInfo {
                name: uri.clone(),
                size: file.size,
                created_at: Some(file.created_at),
                modified_at: Some(file.modified_at),
            })
            .collect())
    }

    async fn delete(&self, uri: &str) -> ServerResult<()> {
        self.files
            .lock()
            .unwrap()
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| ServerError::EntryNotFound(uri.to_string()))
    }

    async fn copy(&self, from_uri: &str, to_uri: &str) -> ServerResult<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get(from_uri)
            .cloned()
            .ok_or_else(|| ServerError::EntryNotFound(from_uri.to_string()))?;
        files.insert(to_uri.to_string(), file);
        Ok(())
    }

    async fn read_test(&self, uri: &str, _crypt_password: Option<&str>) -> ServerResult<()> {
        if self.files.lock().unwrap().contains_key(uri) {
            Ok(())
        } else {
            Err(ServerError::EntryNotFound(uri.to_string()))
        }
    }
}

// =============================================================================
// SimulatedArchiver
// =============================================================================

/// Archiver that produces no real archives: it walks a fixed number of
/// progress steps, honors pause/abort callbacks, and registers the produced
/// storage in a [`MemoryStorage`] when one is attached.
pub struct SimulatedArchiver {
    storage: Option<Arc<MemoryStorage>>,
    steps: u64,
    entry_size: u64,
}

impl SimulatedArchiver {
    pub fn new() -> Self {
        Self {
            storage: None,
            steps: 8,
            entry_size: 4096,
        }
    }

    pub fn with_storage(storage: Arc<MemoryStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }
}

impl Default for SimulatedArchiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Archiver for SimulatedArchiver {
    async fn create(
        &self,
        request: CreateRequest,
        events: Arc<dyn RunEvents>,
    ) -> ServerResult<CreateSummary> {
        let total_size = self.steps * self.entry_size;
        for step in 0..self.steps {
            if events.is_aborted() {
                return Err(ServerError::Aborted);
            }
            while events.is_pause_create() && !events.is_aborted() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            events.progress(
                ProgressCounters {
                    done_count: step + 1,
                    done_size: (step + 1) * self.entry_size,
                    total_count: self.steps,
                    total_size,
                    storage_done_size: if request.no_storage || request.dry_run {
                        0
                    } else {
                        (step + 1) * self.entry_size / 2
                    },
                    storage_total_size: if request.no_storage || request.dry_run {
                        0
                    } else {
                        total_size / 2
                    },
                },
                &format!("entry-{step}"),
            );
            tokio::task::yield_now().await;
        }

        let mut summary = CreateSummary {
            total_entry_count: self.steps,
            total_entry_size: total_size,
            storage_size: 0,
            storage_names: Vec::new(),
        };
        if !request.dry_run && !request.no_storage {
            summary.storage_size = total_size / 2;
            summary.storage_names.push(request.storage_name.clone());
            if let Some(storage) = &self.storage {
                storage.put_file(&request.storage_name, summary.storage_size, Utc::now());
            }
        }
        Ok(summary)
    }

    async fn restore(
        &self,
        _request: RestoreRequest,
        events: Arc<dyn RunEvents>,
    ) -> ServerResult<()> {
        for step in 0..self.steps {
            if events.is_aborted() {
                return Err(ServerError::Aborted);
            }
            while events.is_pause_restore() && !events.is_aborted() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            events.progress(
                ProgressCounters {
                    done_count: step + 1,
                    done_size: (step + 1) * self.entry_size,
                    total_count: self.steps,
                    total_size: self.steps * self.entry_size,
                    storage_done_size: 0,
                    storage_total_size: 0,
                },
                &format!("entry-{step}"),
            );
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

// =============================================================================
// MemoryContinuousLog
// =============================================================================

/// Pending-change set keyed by `(jobUUID, scheduleUUID)`.
#[derive(Default)]
pub struct MemoryContinuousLog {
    pending: Mutex<HashSet<(Uuid, Uuid)>>,
}

impl MemoryContinuousLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, job_uuid: Uuid, schedule_uuid: Uuid) {
        self.pending.lock().unwrap().insert((job_uuid, schedule_uuid));
    }
}

impl ContinuousLog for MemoryContinuousLog {
    fn has_pending(&self, job_uuid: Uuid, schedule_uuid: Uuid) -> bool {
        self.pending
            .lock()
            .unwrap()
            .contains(&(job_uuid, schedule_uuid))
    }

    fn consume(&self, job_uuid: Uuid, schedule_uuid: Uuid) {
        self.pending
            .lock()
            .unwrap()
            .remove(&(job_uuid, schedule_uuid));
    }
}

// =============================================================================
// Noop script runner & mount manager
// =============================================================================

/// Records invocations instead of spawning shells.
#[derive(Default)]
pub struct RecordingScriptRunner {
    pub invocations: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl RecordingScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl ScriptRunner for RecordingScriptRunner {
    async fn run(&self, script: &str, _macros: &HashMap<String, String>) -> ServerResult<()> {
        self.invocations.lock().unwrap().push(script.to_string());
        if *self.fail.lock().unwrap() {
            return Err(ServerError::Failure(format!("script failed: {script}")));
        }
        Ok(())
    }
}

/// Tracks mount/unmount balance.
#[derive(Default)]
pub struct RecordingMountManager {
    pub mounted: Mutex<Vec<String>>,
}

impl RecordingMountManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MountManager for RecordingMountManager {
    async fn mount(&self, name: &str, _device: &str) -> ServerResult<()> {
        self.mounted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn unmount(&self, name: &str) -> ServerResult<()> {
        let mut mounted = self.mounted.lock().unwrap();
        if let Some(index) = mounted.iter().position(|m| m == name) {
            mounted.remove(index);
        }
        Ok(())
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

/// A fully wired kernel over the in-memory capabilities, with its state
/// rooted in a throwaway directory.
pub struct TestDependencies {
    pub kernel: Arc<super::deps::ServerKernel>,
    pub index: Arc<MemoryIndex>,
    pub storage: Arc<MemoryStorage>,
    pub continuous: Arc<MemoryContinuousLog>,
    pub scripts: Arc<RecordingScriptRunner>,
    pub mounts: Arc<RecordingMountManager>,
}

impl TestDependencies {
    pub fn new(mode: crate::common::types::ServerMode) -> Self {
        let base = std::env::temp_dir().join(format!("server-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(base.join("jobs")).expect("create test base dir");

        let index = MemoryIndex::new().into_shared();
        let storage = MemoryStorage::new().into_shared();
        let continuous = Arc::new(MemoryContinuousLog::new());
        let scripts = Arc::new(RecordingScriptRunner::new());
        let mounts = Arc::new(RecordingMountManager::new());

        let config = crate::config::Config {
            port: 0,
            tls_port: None,
            mode,
            jobs_directory: base.join("jobs"),
            config_file: base.join("server.conf"),
            pairing_file: base.join("pairing"),
            machine_id: "test-machine".to_string(),
        };

        let kernel = super::deps::ServerKernel::build(
            config,
            super::deps::Capabilities {
                index: index.clone(),
                storage: storage.clone(),
                archiver: Arc::new(SimulatedArchiver::with_storage(storage.clone())),
                continuous: continuous.clone(),
                scripts: scripts.clone(),
                mounts: mounts.clone(),
            },
        )
        .expect("build test kernel");

        Self {
            kernel,
            index,
            storage,
            continuous,
            scripts,
            mounts,
        }
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new(crate::common::types::ServerMode::Master)
    }
}
