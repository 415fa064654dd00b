//! Index update workers.
//!
//! Two cooperating loops keep the index aligned with storage reality, both
//! gated on the maintenance window and the pause flags:
//!
//! - the update worker processes storages in `UpdateRequested` state by
//!   reading the archive and refreshing its index rows;
//! - the auto worker enumerates the storage directories referenced by jobs,
//!   requests updates for new or changed `*.bar` files, and purges stale
//!   auto-added rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delay::{delay, DelayOutcome};
use super::deps::ServerKernel;
use super::pause::PauseMode;
use super::service_host::Service;
use super::traits::{IndexHandle, NewStorage, StorageCredentials, StorageSpecifier};
use crate::common::error::{ServerError, ServerResult};
use crate::domains::index::model::{IndexMode, IndexState};

const UPDATE_PERIOD: Duration = Duration::from_secs(60);
const AUTO_PERIOD: Duration = Duration::from_secs(600);

/// Files younger than this are skipped: they may belong to a running backup.
fn min_file_age() -> chrono::Duration {
    chrono::Duration::minutes(30)
}

fn maintenance_allowed(kernel: &ServerKernel, now: DateTime<Utc>) -> bool {
    kernel.index.is_initialized()
        && kernel.options.is_maintenance_time(now)
        && !kernel.pause.is_paused(PauseMode::IndexMaintenance)
}

// ============================================================================
// Update worker
// ============================================================================

/// Processes storages whose index state is `UpdateRequested`.
pub struct IndexUpdateWorker {
    kernel: Arc<ServerKernel>,
}

impl IndexUpdateWorker {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    /// Process at most one requested storage. Public for tests.
    pub async fn process_one(&self, handle: &IndexHandle, now: DateTime<Utc>) -> ServerResult<bool> {
        if !maintenance_allowed(&self.kernel, now)
            || self.kernel.pause.is_paused(PauseMode::IndexUpdate)
        {
            return Ok(false);
        }

        let Some(mut storage) = self.kernel.index.next_update_requested(handle).await? else {
            return Ok(false);
        };

        let specifier = match StorageSpecifier::parse(&storage.name) {
            Ok(specifier) => specifier,
            Err(err) => {
                storage.index_state = IndexState::Error;
                storage.error_message = format!("unparsable storage name: {err}");
                self.kernel.index.update_storage(handle, &storage).await?;
                return Ok(true);
            }
        };

        // Try every credential pair known for this target.
        let mut initialized = false;
        for credentials in self.credential_candidates(&specifier).await {
            if self
                .kernel
                .storage
                .init(&specifier, &credentials)
                .await
                .is_ok()
            {
                initialized = true;
                break;
            }
        }
        if !initialized {
            storage.index_state = IndexState::Error;
            storage.error_message = "storage not accessible".to_string();
            self.kernel.index.update_storage(handle, &storage).await?;
            return Ok(true);
        }

        storage.index_state = IndexState::Update;
        self.kernel.index.update_storage(handle, &storage).await?;

        // Walk the crypt password candidates until the archive opens.
        let mut result = Err(ServerError::NoCryptPassword);
        for password in self.crypt_candidates().await {
            if self.kernel.quit.is_cancelled() {
                result = Err(ServerError::Interrupted);
                break;
            }
            result = self
                .kernel
                .storage
                .read_test(&storage.name, password.as_deref())
                .await;
            match &result {
                Ok(()) => break,
                Err(ServerError::Interrupted) => break,
                Err(_) => {}
            }
        }

        match result {
            Ok(()) => {
                storage.index_state = IndexState::Ok;
                storage.last_checked = Some(now);
                storage.error_message.clear();
                info!(target: "index", storage = %storage.name, "index updated");
            }
            Err(ServerError::Interrupted) => {
                // Try again next round.
                storage.index_state = IndexState::UpdateRequested;
            }
            Err(err) => {
                storage.index_state = IndexState::Error;
                storage.error_message = err.to_string();
                if !matches!(err, ServerError::ConnectFail(_)) {
                    warn!(target: "index", storage = %storage.name, error = %err, "index update failed");
                }
            }
        }
        self.kernel.index.update_storage(handle, &storage).await?;
        Ok(true)
    }

    async fn credential_candidates(
        &self,
        specifier: &StorageSpecifier,
    ) -> Vec<StorageCredentials> {
        let mut candidates = vec![StorageCredentials {
            user: specifier.user.clone(),
            password: None,
        }];

        if let Ok(jobs) = self.kernel.jobs.read().await {
            for job in jobs.iter() {
                let Ok(job_spec) = StorageSpecifier::parse(&job.storage_name) else {
                    continue;
                };
                if job_spec.scheme == specifier.scheme && job_spec.host == specifier.host {
                    let candidate = StorageCredentials {
                        user: job_spec.user.clone(),
                        password: None,
                    };
                    if !candidates.contains(&candidate) {
                        candidates.push(candidate);
                    }
                }
            }
        }
        candidates.push(StorageCredentials::default());
        candidates
    }

    /// Union of all job crypt passwords, the global crypt password, and none.
    async fn crypt_candidates(&self) -> Vec<Option<String>> {
        let mut candidates: Vec<Option<String>> = Vec::new();
        if let Ok(jobs) = self.kernel.jobs.read().await {
            for job in jobs.iter() {
                if let Some(password) = &job.crypt.password {
                    if !candidates.iter().any(|c| c.as_deref() == Some(password)) {
                        candidates.push(Some(password.clone()));
                    }
                }
            }
        }
        if let Some(password) = self.kernel.options.with(|o| o.crypt_password.clone()) {
            if !candidates.iter().any(|c| c.as_deref() == Some(password.as_str())) {
                candidates.push(Some(password));
            }
        }
        candidates.push(None);
        candidates
    }
}

#[async_trait::async_trait]
impl Service for IndexUpdateWorker {
    fn name(&self) -> &'static str {
        "index-update"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        if !self.kernel.index.is_initialized() {
            warn!(target: "index", "no index available, update worker exits");
            return Ok(());
        }
        let handle = match self.kernel.index.open_handle().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "index", error = %err, "cannot open index, update worker exits");
                return Ok(());
            }
        };

        loop {
            match self.process_one(&handle, Utc::now()).await {
                // More work may be queued: keep draining.
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    if !matches!(err, ServerError::ConnectFail(_)) {
                        warn!(target: "index", error = %err, "index update iteration failed");
                    }
                }
            }

            if delay(
                UPDATE_PERIOD,
                Some(&self.kernel.triggers.update_index),
                &shutdown,
            )
            .await
                == DelayOutcome::Quit
            {
                self.kernel.index.close_handle(handle).await;
                return Ok(());
            }
        }
    }
}

// ============================================================================
// Auto worker
// ============================================================================

/// Discovers archive files in referenced storage directories and keeps the
/// auto-added rows fresh.
pub struct AutoIndexWorker {
    kernel: Arc<ServerKernel>,
}

impl AutoIndexWorker {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    /// Directories referenced by any job's storage template or persistence
    /// move target, with text macros expanded away.
    async fn referenced_directories(&self) -> ServerResult<HashSet<String>> {
        let jobs = self.kernel.jobs.read().await?;
        let mut directories = HashSet::new();
        for job in jobs.iter() {
            if let Ok(spec) = StorageSpecifier::parse(&strip_macros(&job.storage_name)) {
                let directory = spec.directory();
                if !directory.is_empty() {
                    directories.insert(directory);
                }
            }
            for rule in job.persistence.iter() {
                if let Some(move_to) = &rule.move_to {
                    directories.insert(move_to.trim_end_matches('/').to_string());
                }
            }
        }
        Ok(directories)
    }

    /// One auto-index sweep. Public for tests.
    pub async fn sweep(&self, handle: &IndexHandle, now: DateTime<Utc>) -> ServerResult<()> {
        if !maintenance_allowed(&self.kernel, now) {
            return Ok(());
        }

        for directory in self.referenced_directories().await? {
            let files = match self.kernel.storage.list(&directory).await {
                Ok(files) => files,
                Err(err) => {
                    debug!(target: "index", directory = %directory, error = %err, "directory not reachable");
                    continue;
                }
            };

            for file in files {
                if !file.name.ends_with(".bar") {
                    continue;
                }
                // Skip fresh files: they may still be written by a running
                // backup.
                let file_age_ok = file
                    .created_at
                    .map(|t| now - t >= min_file_age())
                    .unwrap_or(true);
                if !file_age_ok {
                    continue;
                }

                match self.kernel.index.storage_by_name(handle, &file.name).await? {
                    Some(mut row) => {
                        let modified_after_check = match (file.modified_at, row.last_checked) {
                            (Some(modified), Some(checked)) => modified > checked,
                            (Some(_), None) => true,
                            (None, _) => false,
                        };
                        if modified_after_check {
                            row.index_state = IndexState::UpdateRequested;
                        } else {
                            row.last_checked = Some(now);
                        }
                        row.size = file.size;
                        self.kernel.index.update_storage(handle, &row).await?;
                    }
                    None => {
                        debug!(target: "index", storage = %file.name, "new archive found");
                        self.kernel
                            .index
                            .add_storage(
                                handle,
                                NewStorage {
                                    entity_id: None,
                                    name: file.name.clone(),
                                    created_at: file.created_at.unwrap_or(now),
                                    size: file.size,
                                    index_state: IndexState::UpdateRequested,
                                    index_mode: IndexMode::Auto,
                                },
                            )
                            .await?;
                        self.kernel.triggers.update_index.signal();
                    }
                }
            }
        }

        self.auto_clean(handle, now).await
    }

    /// Purge auto-mode rows whose creation and last check both exceed the
    /// configured keep time.
    async fn auto_clean(&self, handle: &IndexHandle, now: DateTime<Utc>) -> ServerResult<()> {
        let keep = chrono::Duration::seconds(
            self.kernel.options.with(|o| o.index_auto_keep_seconds) as i64,
        );
        let rows = self
            .kernel
            .index
            .storages(
                handle,
                super::traits::StorageFilter {
                    index_mode: Some(IndexMode::Auto),
                    ..Default::default()
                },
            )
            .await?;

        for row in rows {
            let created_old = now - row.created_at > keep;
            let checked_old = row.last_checked.map(|t| now - t > keep).unwrap_or(false);
            if created_old && checked_old {
                info!(target: "index", storage = %row.name, "auto-clean removed stale index row");
                self.kernel.index.delete_storage(handle, row.id).await?;
            }
        }
        Ok(())
    }
}

/// Remove `%macro` tokens from a storage template, leaving the fixed parts.
fn strip_macros(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        while chars.peek().is_some_and(|n| n.is_ascii_alphanumeric()) {
            chars.next();
        }
    }
    out
}

#[async_trait::async_trait]
impl Service for AutoIndexWorker {
    fn name(&self) -> &'static str {
        "auto-index"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        if !self.kernel.index.is_initialized() {
            warn!(target: "index", "no index available, auto worker exits");
            return Ok(());
        }
        let handle = match self.kernel.index.open_handle().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "index", error = %err, "cannot open index, auto worker exits");
                return Ok(());
            }
        };

        loop {
            if let Err(err) = self.sweep(&handle, Utc::now()).await {
                if !matches!(err, ServerError::ConnectFail(_)) {
                    warn!(target: "index", error = %err, "auto index sweep failed");
                }
            }

            if delay(
                AUTO_PERIOD,
                Some(&self.kernel.triggers.auto_index),
                &shutdown,
            )
            .await
                == DelayOutcome::Quit
            {
                self.kernel.index.close_handle(handle).await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::domains::job::model::Job;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::kernel::traits::{Index, Storage};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn old(hours: i64) -> DateTime<Utc> {
        now() - chrono::Duration::hours(hours)
    }

    async fn job_with_storage(deps: &TestDependencies, template: &str) {
        let mut job = Job::new("indexed", now());
        job.storage_name = template.to_string();
        deps.kernel.jobs.write().await.unwrap().push(job);
    }

    #[tokio::test]
    async fn test_auto_worker_discovers_new_archives() {
        let deps = TestDependencies::new(ServerMode::Master);
        let worker = AutoIndexWorker::new(deps.kernel.clone());
        job_with_storage(&deps, "/backup/daily/%name-%type.bar").await;

        deps.storage.put_file("/backup/daily/old.bar", 100, old(2));
        deps.storage.put_file("/backup/daily/new.bar", 100, old(0));
        deps.storage.put_file("/backup/daily/notes.txt", 5, old(2));

        let handle = deps.index.open_handle().await.unwrap();
        worker.sweep(&handle, now()).await.unwrap();

        // Only the settled .bar file got a row; the fresh file is skipped
        // (it may belong to a running backup), the txt ignored.
        let row = deps
            .index
            .storage_by_name(&handle, "/backup/daily/old.bar")
            .await
            .unwrap()
            .expect("row added");
        assert_eq!(row.index_state, IndexState::UpdateRequested);
        assert_eq!(row.index_mode, IndexMode::Auto);
        assert!(deps
            .index
            .storage_by_name(&handle, "/backup/daily/new.bar")
            .await
            .unwrap()
            .is_none());
        assert!(deps
            .index
            .storage_by_name(&handle, "/backup/daily/notes.txt")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_auto_worker_requests_update_on_modified_file() {
        let deps = TestDependencies::new(ServerMode::Master);
        let worker = AutoIndexWorker::new(deps.kernel.clone());
        job_with_storage(&deps, "/backup/daily/a.bar").await;

        deps.storage.put_file("/backup/daily/a.bar", 100, old(48));
        let handle = deps.index.open_handle().await.unwrap();
        worker.sweep(&handle, now()).await.unwrap();

        // Mark checked, then modify the file afterwards.
        let mut row = deps
            .index
            .storage_by_name(&handle, "/backup/daily/a.bar")
            .await
            .unwrap()
            .unwrap();
        row.index_state = IndexState::Ok;
        row.last_checked = Some(old(24));
        deps.index.update_storage(&handle, &row).await.unwrap();
        deps.storage.put_file("/backup/daily/a.bar", 120, old(1));

        worker.sweep(&handle, now()).await.unwrap();
        let row = deps
            .index
            .storage_by_name(&handle, "/backup/daily/a.bar")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.index_state, IndexState::UpdateRequested);
    }

    #[tokio::test]
    async fn test_auto_clean_purges_stale_auto_rows() {
        let deps = TestDependencies::new(ServerMode::Master);
        let worker = AutoIndexWorker::new(deps.kernel.clone());
        deps.kernel
            .options
            .option_set("index-auto-keep-time", "3600")
            .unwrap();

        let handle = deps.index.open_handle().await.unwrap();
        let stale_id = deps
            .index
            .add_storage(
                &handle,
                NewStorage {
                    entity_id: None,
                    name: "/gone/x.bar".to_string(),
                    created_at: old(10),
                    size: 10,
                    index_state: IndexState::Ok,
                    index_mode: IndexMode::Auto,
                },
            )
            .await
            .unwrap();
        let mut stale = deps
            .index
            .storage_by_id(&handle, stale_id)
            .await
            .unwrap()
            .unwrap();
        stale.last_checked = Some(old(10));
        deps.index.update_storage(&handle, &stale).await.unwrap();

        // Manual rows are never auto-cleaned.
        deps.index
            .add_storage(
                &handle,
                NewStorage {
                    entity_id: None,
                    name: "/kept/y.bar".to_string(),
                    created_at: old(10),
                    size: 10,
                    index_state: IndexState::Ok,
                    index_mode: IndexMode::Manual,
                },
            )
            .await
            .unwrap();

        worker.auto_clean(&handle, now()).await.unwrap();
        assert!(deps
            .index
            .storage_by_id(&handle, stale_id)
            .await
            .unwrap()
            .is_none());
        assert!(deps
            .index
            .storage_by_name(&handle, "/kept/y.bar")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_update_worker_processes_requested_storage() {
        let deps = TestDependencies::new(ServerMode::Master);
        let worker = IndexUpdateWorker::new(deps.kernel.clone());

        let handle = deps.index.open_handle().await.unwrap();
        deps.storage.put_file("/backup/a.bar", 100, old(2));
        let id = deps
            .index
            .add_storage(
                &handle,
                NewStorage {
                    entity_id: None,
                    name: "/backup/a.bar".to_string(),
                    created_at: old(2),
                    size: 100,
                    index_state: IndexState::UpdateRequested,
                    index_mode: IndexMode::Auto,
                },
            )
            .await
            .unwrap();

        assert!(worker.process_one(&handle, now()).await.unwrap());
        let row = deps.index.storage_by_id(&handle, id).await.unwrap().unwrap();
        assert_eq!(row.index_state, IndexState::Ok);
        assert_eq!(row.last_checked, Some(now()));
    }

    #[tokio::test]
    async fn test_update_worker_marks_missing_archive_error() {
        let deps = TestDependencies::new(ServerMode::Master);
        let worker = IndexUpdateWorker::new(deps.kernel.clone());

        let handle = deps.index.open_handle().await.unwrap();
        let id = deps
            .index
            .add_storage(
                &handle,
                NewStorage {
                    entity_id: None,
                    name: "/backup/missing.bar".to_string(),
                    created_at: old(2),
                    size: 100,
                    index_state: IndexState::UpdateRequested,
                    index_mode: IndexMode::Auto,
                },
            )
            .await
            .unwrap();

        assert!(worker.process_one(&handle, now()).await.unwrap());
        let row = deps.index.storage_by_id(&handle, id).await.unwrap().unwrap();
        assert_eq!(row.index_state, IndexState::Error);
        assert!(!row.error_message.is_empty());
    }

    #[tokio::test]
    async fn test_update_worker_respects_pause() {
        let deps = TestDependencies::new(ServerMode::Master);
        let worker = IndexUpdateWorker::new(deps.kernel.clone());
        deps.kernel.pause.pause(
            &[PauseMode::IndexUpdate],
            now() + chrono::Duration::hours(1),
        );

        let handle = deps.index.open_handle().await.unwrap();
        assert!(!worker.process_one(&handle, now()).await.unwrap());
    }

    #[test]
    fn test_strip_macros() {
        assert_eq!(strip_macros("/backup/%name-%type.bar"), "/backup/-.bar");
        assert_eq!(strip_macros("/plain/path.bar"), "/plain/path.bar");
        assert_eq!(strip_macros("50%% off"), "50% off");
    }
}
