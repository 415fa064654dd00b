//! Job execution runner.
//!
//! A single service that picks the next runnable job (continuous first),
//! snapshots its inputs, and drives pre-script → create/restore →
//! post-script → history. Remote jobs execute through their slave
//! connector; the callbacks are routed over the control channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wireline::ValueMap;

use super::deps::ServerKernel;
use super::service_host::Service;
use super::slaves::SlaveConnector;
use super::traits::{
    CreateRequest, IndexHandle, NewEntity, NewHistory, RunEvents, StorageSpecifier,
};
use crate::common::error::{ServerError, ServerResult};
use crate::common::types::{ArchiveType, SlaveState};
use crate::domains::job::model::{Job, Mount, SlaveBinding, StartRequest};
use crate::domains::job::running::{JobState, ProgressCounters, VolumeRequest, VolumeResult};
use crate::domains::job::schedule::next_due_at;
use crate::domains::job::JobList;
use crate::kernel::pause::PauseMode;

const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Everything a run needs, copied out of the job under the lock.
struct JobSnapshot {
    uuid: Uuid,
    name: String,
    storage_template: String,
    includes: Vec<crate::domains::job::model::IncludeEntry>,
    excludes: Vec<crate::domains::job::model::ExcludePattern>,
    mounts: Vec<Mount>,
    crypt: crate::domains::job::model::CryptSettings,
    pre_command: Option<String>,
    post_command: Option<String>,
    slave: Option<SlaveBinding>,
    request: StartRequest,
    abort: Arc<std::sync::atomic::AtomicBool>,
}

/// Outcome carried into history and the final log line.
struct RunOutcome {
    error: Option<ServerError>,
    aborted: bool,
    total_entry_count: u64,
    total_entry_size: u64,
    storage_size: u64,
}

/// The job runner service.
pub struct JobRunner {
    kernel: Arc<ServerKernel>,
}

impl JobRunner {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    /// Pick and execute the next runnable job. Returns false when none is
    /// runnable. Public for tests.
    pub async fn process_next(&self) -> ServerResult<bool> {
        let Some(snapshot) = self.select_next().await? else {
            return Ok(false);
        };
        self.run_job(snapshot).await;
        Ok(true)
    }

    /// Select the next runnable job under the write lock and mark it
    /// running. Continuous jobs take priority.
    async fn select_next(&self) -> ServerResult<Option<JobSnapshot>> {
        let mut jobs = self.kernel.jobs.write().await?;

        let runnable = |job: &Job| {
            job.running_info.state == JobState::Waiting
                && (!job.is_remote() || job.slave_state == SlaveState::Paired)
        };
        let continuous = |job: &Job| {
            job.start_request
                .as_ref()
                .is_some_and(|r| r.archive_type == ArchiveType::Continuous)
        };

        let index = jobs
            .iter()
            .position(|j| runnable(j) && continuous(j))
            .or_else(|| jobs.iter().position(runnable));
        let Some(index) = index else {
            return Ok(None);
        };

        let job = &mut jobs[index];
        let Some(request) = job.start_request.take() else {
            job.running_info.state = JobState::None;
            return Ok(None);
        };

        job.running_info.state = JobState::Running;
        if let Some(schedule_uuid) = request.schedule_uuid {
            if let Some(schedule) = job.schedule_mut(schedule_uuid) {
                schedule.last_executed = Some(request.due_at);
            }
            // A continuous run consumes the pending change-log entries that
            // triggered it.
            if request.archive_type == ArchiveType::Continuous {
                self.kernel.continuous.consume(job.uuid, schedule_uuid);
            }
        }

        let snapshot = JobSnapshot {
            uuid: job.uuid,
            name: job.name.clone(),
            storage_template: job.storage_name.clone(),
            includes: job.includes.clone(),
            excludes: job.excludes.clone(),
            mounts: job.mounts.clone(),
            crypt: job.crypt.clone(),
            pre_command: job.pre_command.clone(),
            post_command: job.post_command.clone(),
            slave: job.slave.clone(),
            abort: job.running_info.requested_abort.clone(),
            request,
        };
        drop(jobs);
        self.kernel.jobs.signal_modified();
        Ok(Some(snapshot))
    }

    async fn run_job(&self, snapshot: JobSnapshot) {
        let started_at = Utc::now();
        info!(
            job = %snapshot.name,
            job_uuid = %snapshot.uuid,
            archive_type = %snapshot.request.archive_type,
            actor = %snapshot.request.actor,
            "job started"
        );

        // Remote jobs hold their connector for the whole run.
        let connector = match self.acquire_connector(&snapshot) {
            Ok(connector) => connector,
            Err(err) => {
                self.finish(&snapshot, started_at, failed(err)).await;
                return;
            }
        };

        // Index is best-effort: without it the run proceeds, history is
        // just not written.
        let handle = if self.kernel.index.is_initialized() {
            self.kernel.index.open_handle().await.ok()
        } else {
            None
        };

        let outcome = self
            .execute(&snapshot, connector.as_ref(), handle.as_ref())
            .await;
        self.finish_with_history(&snapshot, started_at, outcome, handle)
            .await;

        if let Some(connector) = connector {
            connector.unlock();
        }
    }

    fn acquire_connector(
        &self,
        snapshot: &JobSnapshot,
    ) -> ServerResult<Option<Arc<SlaveConnector>>> {
        let Some(binding) = &snapshot.slave else {
            return Ok(None);
        };
        let connector = self
            .kernel
            .slaves
            .connector_for(binding)
            .filter(|c| c.is_paired())
            .ok_or_else(|| ServerError::SlaveDisconnected(binding.host.clone()))?;
        connector.lock();
        Ok(Some(connector))
    }

    async fn execute(
        &self,
        snapshot: &JobSnapshot,
        connector: Option<&Arc<SlaveConnector>>,
        handle: Option<&IndexHandle>,
    ) -> RunOutcome {
        // Expand and validate the storage name before anything runs.
        let macros = self.build_macros(snapshot).await;
        let storage_name = expand_text(&snapshot.storage_template, &macros);
        let specifier = match StorageSpecifier::parse(&storage_name) {
            Ok(specifier) => specifier,
            Err(_) => {
                return failed(ServerError::InvalidValue {
                    name: "storage".to_string(),
                    value: format!("invalid storage '{storage_name}'"),
                })
            }
        };
        debug!(job = %snapshot.name, storage = %storage_name, scheme = %specifier.scheme, "storage resolved");

        // Pre-script failure aborts the run.
        if let Some(pre) = &snapshot.pre_command {
            if let Err(err) = self.kernel.scripts.run(pre, &macros).await {
                warn!(job = %snapshot.name, error = %err, "pre-script failed");
                return failed(err);
            }
        }

        let events: Arc<dyn RunEvents> = Arc::new(JobRunEvents {
            jobs: self.kernel.jobs.clone(),
            job_uuid: snapshot.uuid,
            abort: snapshot.abort.clone(),
            pause: self.kernel.pause.clone(),
            crypt_password: snapshot
                .crypt
                .password
                .clone()
                .or_else(|| self.kernel.options.with(|o| o.crypt_password.clone())),
            quit: self.kernel.quit.clone(),
        });

        let mut outcome = match connector {
            Some(connector) => {
                self.execute_remote(snapshot, connector, &storage_name, &events)
                    .await
            }
            None => {
                self.execute_local(snapshot, &storage_name, handle, events.clone())
                    .await
            }
        };

        // Post-script failure is recorded but does not undo the work.
        if let Some(post) = &snapshot.post_command {
            if let Err(err) = self.kernel.scripts.run(post, &macros).await {
                warn!(job = %snapshot.name, error = %err, "post-script failed");
                if outcome.error.is_none() && !outcome.aborted {
                    outcome.error = Some(err);
                }
            }
        }
        outcome
    }

    async fn execute_local(
        &self,
        snapshot: &JobSnapshot,
        storage_name: &str,
        handle: Option<&IndexHandle>,
        events: Arc<dyn RunEvents>,
    ) -> RunOutcome {
        // Mount the job's devices; every mounted one is unmounted on every
        // exit path below.
        let mut mounted: Vec<&Mount> = Vec::new();
        for mount in &snapshot.mounts {
            match self.kernel.mounts.mount(&mount.name, &mount.device).await {
                Ok(()) => mounted.push(mount),
                Err(err) => {
                    for mount in mounted.iter().rev() {
                        let _ = self.kernel.mounts.unmount(&mount.name).await;
                    }
                    return failed(err);
                }
            }
        }

        let outcome = self
            .create_archive(snapshot, storage_name, handle, events)
            .await;

        for mount in mounted.iter().rev() {
            if let Err(err) = self.kernel.mounts.unmount(&mount.name).await {
                warn!(mount = %mount.name, error = %err, "unmount failed");
            }
        }
        outcome
    }

    async fn create_archive(
        &self,
        snapshot: &JobSnapshot,
        storage_name: &str,
        handle: Option<&IndexHandle>,
        events: Arc<dyn RunEvents>,
    ) -> RunOutcome {
        let entity_uuid = Uuid::new_v4();
        let entity_id = match handle {
            Some(handle) => self
                .kernel
                .index
                .add_entity(
                    handle,
                    NewEntity {
                        uuid: entity_uuid,
                        job_uuid: snapshot.uuid,
                        schedule_uuid: snapshot.request.schedule_uuid,
                        created_at: snapshot.request.due_at,
                        archive_type: snapshot.request.archive_type,
                    },
                )
                .await
                .ok(),
            None => None,
        };

        let result = self
            .kernel
            .archiver
            .create(
                CreateRequest {
                    job_uuid: snapshot.uuid,
                    entity_uuid,
                    archive_type: snapshot.request.archive_type,
                    storage_name: storage_name.to_string(),
                    includes: snapshot.includes.clone(),
                    excludes: snapshot.excludes.clone(),
                    crypt: snapshot.crypt.clone(),
                    custom_text: snapshot.request.custom_text.clone(),
                    dry_run: snapshot.request.dry_run,
                    no_storage: snapshot.request.no_storage,
                },
                events,
            )
            .await;

        match result {
            Ok(summary) => {
                if let (Some(handle), Some(entity_id)) = (handle, entity_id) {
                    let _ = self
                        .kernel
                        .index
                        .update_entity_totals(
                            handle,
                            entity_id,
                            summary.total_entry_count,
                            summary.total_entry_size,
                        )
                        .await;
                    for name in &summary.storage_names {
                        let _ = self
                            .kernel
                            .index
                            .add_storage(
                                handle,
                                super::traits::NewStorage {
                                    entity_id: Some(entity_id),
                                    name: name.clone(),
                                    created_at: Utc::now(),
                                    size: summary.storage_size,
                                    index_state:
                                        crate::domains::index::model::IndexState::Ok,
                                    index_mode: crate::domains::index::model::IndexMode::Manual,
                                },
                            )
                            .await;
                    }
                }
                RunOutcome {
                    error: None,
                    aborted: false,
                    total_entry_count: summary.total_entry_count,
                    total_entry_size: summary.total_entry_size,
                    storage_size: summary.storage_size,
                }
            }
            Err(ServerError::Aborted) => aborted(),
            Err(err) => failed(err),
        }
    }

    async fn execute_remote(
        &self,
        snapshot: &JobSnapshot,
        connector: &Arc<SlaveConnector>,
        storage_name: &str,
        events: &Arc<dyn RunEvents>,
    ) -> RunOutcome {
        let args = ValueMap::new()
            .with("jobUUID", snapshot.uuid)
            .with("entityUUID", Uuid::new_v4())
            .with("storageName", storage_name)
            .with("archiveType", snapshot.request.archive_type)
            .with("dryRun", if snapshot.request.dry_run { "yes" } else { "no" })
            .with(
                "noStorage",
                if snapshot.request.no_storage { "yes" } else { "no" },
            );

        let events = events.clone();
        let result = connector
            .execute("create", args, move |row| {
                // Progress rows stream back over the control channel.
                let progress = ProgressCounters {
                    done_count: row.data.get_or("doneCount", 0).unwrap_or(0),
                    done_size: row.data.get_or("doneSize", 0).unwrap_or(0),
                    total_count: row.data.get_or("totalCount", 0).unwrap_or(0),
                    total_size: row.data.get_or("totalSize", 0).unwrap_or(0),
                    storage_done_size: row.data.get_or("storageDoneSize", 0).unwrap_or(0),
                    storage_total_size: row.data.get_or("storageTotalSize", 0).unwrap_or(0),
                };
                events.progress(progress, row.data.get_str_or("entryName", ""));
            })
            .await;

        match result {
            Ok(summary) => RunOutcome {
                error: None,
                aborted: false,
                total_entry_count: summary.get_or("totalEntryCount", 0).unwrap_or(0),
                total_entry_size: summary.get_or("totalEntrySize", 0).unwrap_or(0),
                storage_size: summary.get_or("storageSize", 0).unwrap_or(0),
            },
            Err(ServerError::Aborted) => aborted(),
            Err(err) => failed(err),
        }
    }

    async fn finish_with_history(
        &self,
        snapshot: &JobSnapshot,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        handle: Option<IndexHandle>,
    ) {
        if let Some(handle) = &handle {
            let error_code = outcome
                .error
                .as_ref()
                .map(|e| e.wire_code().code())
                .unwrap_or(if outcome.aborted {
                    wireline::WireCode::Aborted.code()
                } else {
                    0
                });
            let row = NewHistory {
                job_uuid: snapshot.uuid,
                schedule_uuid: snapshot.request.schedule_uuid,
                created_at: started_at,
                error_code,
                error_data: outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
                duration_seconds: (Utc::now() - started_at).num_seconds().max(0) as u64,
                total_entry_count: outcome.total_entry_count,
                total_entry_size: outcome.total_entry_size,
            };
            if let Err(err) = self.kernel.index.add_history(handle, row).await {
                warn!(job = %snapshot.name, error = %err, "cannot write history row");
            }
        }

        self.finish(snapshot, started_at, outcome).await;
        self.refresh_aggregates(snapshot, handle).await;
    }

    async fn finish(&self, snapshot: &JobSnapshot, started_at: DateTime<Utc>, outcome: RunOutcome) {
        let now = Utc::now();
        let duration = format_duration((now - started_at).num_seconds().max(0) as u64);

        // Compression ratio only means something when data was written.
        if !snapshot.request.dry_run
            && outcome.total_entry_size > 0
            && outcome.storage_size > 0
            && outcome.error.is_none()
            && !outcome.aborted
        {
            let ratio = 1.0 - outcome.storage_size as f64 / outcome.total_entry_size as f64;
            debug!(job = %snapshot.name, ratio = format!("{:.1}%", ratio * 100.0), "compression ratio");
        }

        let state_update = self
            .kernel
            .jobs
            .with_job_mut(snapshot.uuid, |job| {
                job.last_executed = Some(now);
                if outcome.aborted {
                    job.running_info.state = JobState::Aborted;
                    job.last_error_code = wireline::WireCode::Aborted.code();
                    job.last_error_message = "aborted".to_string();
                    format!("Aborted by {}", abort_actor_of(job))
                } else if let Some(error) = &outcome.error {
                    job.running_info.state = JobState::Error;
                    job.last_error_code = error.wire_code().code();
                    job.last_error_message = error.to_string();
                    format!("Done with error: {error}")
                } else {
                    job.running_info.state = JobState::Done;
                    job.last_error_code = 0;
                    job.last_error_message.clear();
                    "Done".to_string()
                }
            })
            .await;

        match state_update {
            Ok(summary) => {
                info!(target: "jobs", job = %snapshot.name, %duration, "{summary}");
            }
            Err(err) => warn!(job = %snapshot.name, error = %err, "cannot record job outcome"),
        }

        // Announce the next planned run, when one is known.
        if let Ok(next) = self
            .kernel
            .jobs
            .with_job(snapshot.uuid, |job| {
                job.schedules
                    .iter()
                    .filter_map(|s| next_due_at(s, now))
                    .min()
            })
            .await
        {
            if let Some(next) = next {
                info!(target: "jobs", job = %snapshot.name, next = %next, "next scheduled run");
            }
        }

        // Persist per-schedule last-executed times, skipped on dry runs.
        if !snapshot.request.dry_run {
            let job_copy = self
                .kernel
                .jobs
                .with_job(snapshot.uuid, |job| job.clone())
                .await
                .ok();
            if let Some(job) = job_copy {
                if let Err(err) = self.kernel.job_store.write_state(&job) {
                    warn!(job = %snapshot.name, error = %err, "cannot write schedule state file");
                }
            }
        }
    }

    async fn refresh_aggregates(&self, snapshot: &JobSnapshot, handle: Option<IndexHandle>) {
        let Some(handle) = handle else { return };
        if let Err(err) =
            super::aggregate::refresh_job(&self.kernel, &handle, snapshot.uuid).await
        {
            debug!(job = %snapshot.name, error = %err, "aggregate refresh failed");
        }
        self.kernel.index.close_handle(handle).await;
    }

    /// Text macros available to pre/post scripts and the storage template.
    async fn build_macros(&self, snapshot: &JobSnapshot) -> HashMap<String, String> {
        let mut macros = HashMap::new();
        macros.insert("name".to_string(), snapshot.name.clone());
        macros.insert(
            "archive".to_string(),
            snapshot.request.archive_type.to_string(),
        );
        macros.insert("type".to_string(), snapshot.request.archive_type.to_string());
        macros.insert(
            "T".to_string(),
            snapshot.request.due_at.format("%Y-%m-%d-%H-%M").to_string(),
        );
        macros.insert("text".to_string(), snapshot.request.custom_text.clone());

        if let Ok(spec) = StorageSpecifier::parse(&snapshot.storage_template) {
            macros.insert("directory".to_string(), spec.directory());
            let file = spec
                .path
                .rsplit_once('/')
                .map(|(_, f)| f.to_string())
                .unwrap_or_default();
            macros.insert("file".to_string(), file);
        }

        // The next scheduled run across all jobs, for template scripts.
        let now = Utc::now();
        if let Ok(jobs) = self.kernel.jobs.read().await {
            let next = jobs
                .iter()
                .flat_map(|job| {
                    job.schedules
                        .iter()
                        .filter_map(move |s| next_due_at(s, now).map(|t| (t, job, s)))
                })
                .min_by_key(|(t, _, _)| *t);
            if let Some((t, job, schedule)) = next {
                macros.insert("nextJobName".to_string(), job.name.clone());
                macros.insert("nextJobUUID".to_string(), job.uuid.to_string());
                macros.insert("nextScheduleUUID".to_string(), schedule.uuid.to_string());
                macros.insert(
                    "nextSchedule".to_string(),
                    format!(
                        "{} {} {}",
                        schedule.date.format(),
                        schedule.week_days.format(),
                        schedule.time.format()
                    ),
                );
                macros.insert(
                    "nextScheduleDateTime".to_string(),
                    t.format("%Y-%m-%d %H:%M:%S").to_string(),
                );
            }
        }
        macros
    }
}

fn abort_actor_of(job: &Job) -> String {
    if job.running_info.abort_actor.is_empty() {
        "unknown".to_string()
    } else {
        job.running_info.abort_actor.clone()
    }
}

fn failed(error: ServerError) -> RunOutcome {
    RunOutcome {
        error: Some(error),
        aborted: false,
        total_entry_count: 0,
        total_entry_size: 0,
        storage_size: 0,
    }
}

fn aborted() -> RunOutcome {
    RunOutcome {
        error: None,
        aborted: true,
        total_entry_count: 0,
        total_entry_size: 0,
        storage_size: 0,
    }
}

/// `hh:mm:ss` for the outcome log.
pub fn format_duration(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Expand `%name`-style text macros.
pub fn expand_text(template: &str, macros: &HashMap<String, String>) -> String {
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
        let mut key = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() {
                key.push(next);
                chars.next();
            } else {
                break;
            }
        }
        match macros.get(&key) {
            Some(value) => out.push_str(value),
            None => {
                out.push('%');
                out.push_str(&key);
            }
        }
    }
    out
}

// ============================================================================
// Run callbacks
// ============================================================================

/// Callback bridge between the archiver and the job list.
struct JobRunEvents {
    jobs: Arc<JobList>,
    job_uuid: Uuid,
    abort: Arc<std::sync::atomic::AtomicBool>,
    pause: Arc<crate::kernel::pause::PauseFlags>,
    crypt_password: Option<String>,
    quit: CancellationToken,
}

#[async_trait]
impl RunEvents for JobRunEvents {
    fn crypt_password(&self) -> Option<String> {
        self.crypt_password.clone()
    }

    fn progress(&self, progress: ProgressCounters, current_entry: &str) {
        // Progress is advisory: under lock contention the sample is dropped
        // rather than stalling the archiver.
        if let Ok(mut jobs) = self.jobs.try_write() {
            if let Some(job) = jobs.iter_mut().find(|j| j.uuid == self.job_uuid) {
                job.running_info.update_progress(Utc::now(), progress);
                job.running_info.current_entry_name = current_entry.to_string();
            }
        }
    }

    async fn request_volume(&self, volume_number: u32, message: &str) -> VolumeResult {
        // Publish the request and wait for a client answer.
        let set = self
            .jobs
            .with_job_mut(self.job_uuid, |job| {
                job.running_info.volume_request = VolumeRequest::Requested {
                    volume_number,
                    message: message.to_string(),
                };
            })
            .await;
        if set.is_err() {
            return VolumeResult::Aborted;
        }

        loop {
            if self.quit.is_cancelled() {
                return VolumeResult::Aborted;
            }
            let result = self
                .jobs
                .with_job(self.job_uuid, |job| job.running_info.volume_result())
                .await
                .unwrap_or(VolumeResult::Aborted);
            match result {
                VolumeResult::None => {
                    self.jobs.wait_modified(Duration::from_secs(1)).await;
                }
                answered => {
                    let _ = self
                        .jobs
                        .with_job_mut(self.job_uuid, |job| {
                            job.running_info.volume_request = VolumeRequest::Idle;
                        })
                        .await;
                    return answered;
                }
            }
        }
    }

    fn is_pause_create(&self) -> bool {
        self.pause.is_paused(PauseMode::Create)
    }

    fn is_pause_storage(&self) -> bool {
        self.pause.is_paused(PauseMode::Storage)
    }

    fn is_pause_restore(&self) -> bool {
        self.pause.is_paused(PauseMode::Restore)
    }

    fn is_aborted(&self) -> bool {
        self.quit.is_cancelled() || self.abort.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for JobRunner {
    fn name(&self) -> &'static str {
        "job-runner"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = self.kernel.jobs.wait_modified(IDLE_WAIT) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "job selection failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(IDLE_WAIT) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::domains::job::schedule::Schedule;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::kernel::traits::{Index, Storage};
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    async fn triggered_job(deps: &TestDependencies, dry_run: bool) -> Uuid {
        let mut job = Job::new("nightly", utc(2024, 1, 1, 0, 0));
        job.storage_name = "ftp://host/backup/%name-%type.bar".to_string();
        let schedule = Schedule::new(ArchiveType::Full);
        let schedule_uuid = schedule.uuid;
        job.schedules.push(schedule);
        job.trigger(StartRequest {
            archive_type: ArchiveType::Full,
            schedule_uuid: Some(schedule_uuid),
            custom_text: String::new(),
            test_created: false,
            no_storage: false,
            dry_run,
            due_at: utc(2024, 6, 1, 3, 30),
            actor: "test".to_string(),
        });
        let uuid = job.uuid;
        deps.kernel.jobs.write().await.unwrap().push(job);
        uuid
    }

    #[tokio::test]
    async fn test_local_run_completes_and_writes_history() {
        let deps = TestDependencies::new(ServerMode::Master);
        let runner = JobRunner::new(deps.kernel.clone());
        let uuid = triggered_job(&deps, false).await;

        assert!(runner.process_next().await.unwrap());

        let (state, last_executed) = deps
            .kernel
            .jobs
            .with_job(uuid, |j| (j.running_info.state, j.schedules[0].last_executed))
            .await
            .unwrap();
        assert_eq!(state, JobState::Done);
        assert_eq!(last_executed, Some(utc(2024, 6, 1, 3, 30)));

        let handle = deps.index.open_handle().await.unwrap();
        let entities = deps.index.entities(&handle).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].job_uuid, uuid);
        assert_eq!(entities[0].archive_type, ArchiveType::Full);

        let history = deps.index.history(&handle, Some(uuid)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error_code, 0);

        // The produced storage landed in the back-end with macros expanded.
        assert!(deps
            .storage
            .exists("ftp://host/backup/nightly-FULL.bar")
            .await
            .unwrap());

        // Aggregates were refreshed into the job.
        let aggregate = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.aggregate.clone())
            .await
            .unwrap();
        assert_eq!(aggregate.totals(ArchiveType::Full).entity_count, 1);
    }

    #[tokio::test]
    async fn test_abort_before_run_finishes_as_aborted() {
        let deps = TestDependencies::new(ServerMode::Master);
        let runner = JobRunner::new(deps.kernel.clone());
        let uuid = triggered_job(&deps, false).await;

        deps.kernel
            .jobs
            .with_job_mut(uuid, |j| j.request_abort("client-7"))
            .await
            .unwrap();

        assert!(runner.process_next().await.unwrap());
        let state = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.running_info.state)
            .await
            .unwrap();
        assert_eq!(state, JobState::Aborted);
    }

    #[tokio::test]
    async fn test_pre_script_failure_aborts_run() {
        let deps = TestDependencies::new(ServerMode::Master);
        let runner = JobRunner::new(deps.kernel.clone());
        let uuid = triggered_job(&deps, false).await;
        deps.kernel
            .jobs
            .with_job_mut(uuid, |j| j.pre_command = Some("exit 1".to_string()))
            .await
            .unwrap();
        deps.scripts.set_fail(true);

        assert!(runner.process_next().await.unwrap());
        let state = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.running_info.state)
            .await
            .unwrap();
        assert_eq!(state, JobState::Error);

        // Nothing was archived.
        assert_eq!(deps.storage.file_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_no_storage_and_no_state_file() {
        let deps = TestDependencies::new(ServerMode::Master);
        let runner = JobRunner::new(deps.kernel.clone());
        let uuid = triggered_job(&deps, true).await;

        assert!(runner.process_next().await.unwrap());
        assert_eq!(
            deps.kernel
                .jobs
                .with_job(uuid, |j| j.running_info.state)
                .await
                .unwrap(),
            JobState::Done
        );
        assert_eq!(deps.storage.file_count(), 0);
        assert!(!deps.kernel.config.jobs_directory.join(".nightly").exists());
    }

    #[tokio::test]
    async fn test_invalid_storage_name_fails_run() {
        let deps = TestDependencies::new(ServerMode::Master);
        let runner = JobRunner::new(deps.kernel.clone());
        let uuid = triggered_job(&deps, false).await;
        deps.kernel
            .jobs
            .with_job_mut(uuid, |j| j.storage_name = "ftp://".to_string())
            .await
            .unwrap();

        assert!(runner.process_next().await.unwrap());
        let (state, message) = deps
            .kernel
            .jobs
            .with_job(uuid, |j| (j.running_info.state, j.last_error_message.clone()))
            .await
            .unwrap();
        assert_eq!(state, JobState::Error);
        assert!(message.contains("invalid storage"));
    }

    #[tokio::test]
    async fn test_continuous_selected_before_other_types() {
        let deps = TestDependencies::new(ServerMode::Master);
        let runner = JobRunner::new(deps.kernel.clone());

        let make = |name: &str, archive_type: ArchiveType| {
            let mut job = Job::new(name, utc(2024, 1, 1, 0, 0));
            job.storage_name = "/backup/%name.bar".to_string();
            job.trigger(StartRequest {
                archive_type,
                schedule_uuid: None,
                custom_text: String::new(),
                test_created: false,
                no_storage: false,
                dry_run: false,
                due_at: utc(2024, 6, 1, 0, 0),
                actor: "test".to_string(),
            });
            job
        };

        let full = make("full-job", ArchiveType::Full);
        let continuous = make("cont-job", ArchiveType::Continuous);
        let continuous_uuid = continuous.uuid;
        {
            let mut jobs = deps.kernel.jobs.write().await.unwrap();
            jobs.push(full);
            jobs.push(continuous);
        }

        assert!(runner.process_next().await.unwrap());
        // The continuous job ran first even though it was pushed second.
        let state = deps
            .kernel
            .jobs
            .with_job(continuous_uuid, |j| j.running_info.state)
            .await
            .unwrap();
        assert_eq!(state, JobState::Done);
    }

    #[test]
    fn test_expand_text() {
        let mut macros = HashMap::new();
        macros.insert("name".to_string(), "home".to_string());
        macros.insert("type".to_string(), "FULL".to_string());

        assert_eq!(
            expand_text("/backup/%name-%type.bar", &macros),
            "/backup/home-FULL.bar"
        );
        assert_eq!(expand_text("100%%", &macros), "100%");
        assert_eq!(expand_text("%unknown stays", &macros), "%unknown stays");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(3661), "01:01:01");
        assert_eq!(format_duration(86400), "24:00:00");
    }
}
