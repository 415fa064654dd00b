//! Job lifecycle commands.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;
use wireline::ValueMap;

use crate::common::error::{ServerError, ServerResult};
use crate::common::types::ArchiveType;
use crate::domains::job::model::{Job, StartRequest};
use crate::domains::job::running::{JobState, VolumeRequest};
use crate::domains::job::schedule::floor_to_minute;
use crate::server::dispatcher::CommandContext;

pub(super) fn job_uuid_arg(ctx: &CommandContext) -> ServerResult<Uuid> {
    Ok(ctx.args.get_uuid("jobUUID")?)
}

/// `jobList` — one row per configured job.
pub async fn job_list(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let jobs = ctx.kernel.jobs.read().await?;
    for job in jobs.iter() {
        let mut row = ValueMap::new()
            .with("jobUUID", job.uuid)
            .with("name", &job.name)
            .with("state", job.running_info.state)
            .with("archiveName", &job.storage_name)
            .with("remote", if job.is_remote() { "yes" } else { "no" })
            .with("totalEntityCount", job.aggregate.total_entity_count())
            .with("totalEntrySize", job.aggregate.total_entry_size());
        if let Some(slave) = &job.slave {
            row.set("slaveHostName", &slave.host);
            row.set("slaveHostPort", slave.port);
            row.set("slaveState", job.slave_state);
        }
        if let Some(last) = job.last_executed {
            row.set("lastExecutedDateTime", last.timestamp());
        }
        ctx.sink.row(row);
    }
    Ok(ValueMap::new())
}

/// `jobInfo jobUUID=…`.
pub async fn job_info(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job(uuid, |job| {
            let mut data = ValueMap::new()
                .with("jobUUID", job.uuid)
                .with("name", &job.name)
                .with("archiveName", &job.storage_name)
                .with("comment", &job.comment)
                .with("state", job.running_info.state)
                .with("includeCount", job.includes.len())
                .with("excludeCount", job.excludes.len())
                .with("scheduleCount", job.schedules.len())
                .with("persistenceCount", job.persistence.len())
                .with("lastErrorCode", job.last_error_code)
                .with("lastErrorMessage", &job.last_error_message);
            if let Some(last) = job.last_executed {
                data.set("lastExecutedDateTime", last.timestamp());
            }
            for archive_type in ArchiveType::ALL {
                let totals = job.aggregate.totals(archive_type);
                if totals.entity_count > 0 {
                    data.set(
                        format!("entityCount{archive_type}"),
                        totals.entity_count,
                    );
                    data.set(format!("entrySize{archive_type}"), totals.entry_size);
                }
            }
            data
        })
        .await
}

/// `jobNew name=…` — create a job and its config file.
pub async fn job_new(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let name = ctx.args.get_str("name")?.to_string();
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        return Err(ServerError::InvalidValue {
            name: "name".to_string(),
            value: name,
        });
    }

    let mut jobs = ctx.kernel.jobs.write().await?;
    if jobs.iter().any(|j| j.name == name) {
        return Err(ServerError::JobAlreadyExists(name));
    }
    let job = Job::new(&name, Utc::now());
    let uuid = job.uuid;
    ctx.kernel.job_store.write_job(&job)?;
    jobs.push(job);
    drop(jobs);
    ctx.kernel.jobs.signal_modified();

    info!(job = %name, %uuid, "job created");
    Ok(ValueMap::new().with("jobUUID", uuid))
}

/// `jobClone jobUUID=… name=…`.
pub async fn job_clone(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let name = ctx.args.get_str("name")?.to_string();

    let mut jobs = ctx.kernel.jobs.write().await?;
    if jobs.iter().any(|j| j.name == name) {
        return Err(ServerError::JobAlreadyExists(name));
    }
    let source = jobs
        .iter()
        .find(|j| j.uuid == uuid)
        .ok_or_else(|| ServerError::JobNotFound(uuid.to_string()))?;

    let mut clone = source.clone();
    clone.uuid = Uuid::new_v4();
    clone.name = name.clone();
    // The clone is a fresh job: new schedule identities, no run state.
    for schedule in &mut clone.schedules {
        schedule.uuid = Uuid::new_v4();
        schedule.last_executed = None;
    }
    clone.running_info = Default::default();
    clone.start_request = None;
    clone.last_executed = None;
    clone.aggregate = Default::default();
    clone.schedule_aggregates = Default::default();

    let clone_uuid = clone.uuid;
    ctx.kernel.job_store.write_job(&clone)?;
    jobs.push(clone);
    drop(jobs);
    ctx.kernel.jobs.signal_modified();
    Ok(ValueMap::new().with("jobUUID", clone_uuid))
}

/// `jobRename jobUUID=… name=…`.
pub async fn job_rename(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let new_name = ctx.args.get_str("name")?.to_string();

    let mut jobs = ctx.kernel.jobs.write().await?;
    if jobs.iter().any(|j| j.name == new_name) {
        return Err(ServerError::JobAlreadyExists(new_name));
    }
    let job = jobs
        .iter_mut()
        .find(|j| j.uuid == uuid)
        .ok_or_else(|| ServerError::JobNotFound(uuid.to_string()))?;

    // Rename on disk first so a failure leaves the in-memory name intact.
    ctx.kernel.job_store.rename_job(&job.name, &new_name)?;
    job.name = new_name;
    drop(jobs);
    ctx.kernel.jobs.signal_modified();
    Ok(ValueMap::new())
}

/// `jobDelete jobUUID=…` — refused while the job is active.
pub async fn job_delete(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;

    let mut jobs = ctx.kernel.jobs.write().await?;
    let index = jobs
        .iter()
        .position(|j| j.uuid == uuid)
        .ok_or_else(|| ServerError::JobNotFound(uuid.to_string()))?;
    if jobs[index].is_active() {
        return Err(ServerError::JobRunning(jobs[index].name.clone()));
    }
    let job = jobs.remove(index);
    drop(jobs);

    ctx.kernel.job_store.delete_job(&job.name)?;
    ctx.kernel.jobs.signal_modified();
    info!(job = %job.name, "job deleted");
    Ok(ValueMap::new())
}

/// `jobFlush` — write all modified jobs to disk.
pub async fn job_flush(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let to_write: Vec<Job> = {
        let mut jobs = ctx.kernel.jobs.write().await?;
        jobs.iter_mut()
            .filter(|j| j.modified)
            .map(|j| {
                j.modified = false;
                j.clone()
            })
            .collect()
    };
    for job in &to_write {
        ctx.kernel.job_store.write_job(job)?;
    }
    Ok(ValueMap::new().with("count", to_write.len()))
}

/// `jobStart jobUUID=… archiveType=… [dryRun] [noStorage] [customText]`.
pub async fn job_start(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let archive_type: ArchiveType = ctx.args.get_or("archiveType", ArchiveType::Normal)?;
    let dry_run = ctx.args.get_bool_or("dryRun", false)?;
    let no_storage = ctx.args.get_bool_or("noStorage", false)?;
    let test_created = ctx.args.get_bool_or("testCreated", false)?;
    let custom_text = ctx.args.get_str_or("customText", "").to_string();
    let actor = ctx.session.handle.name();

    let triggered = ctx
        .kernel
        .jobs
        .with_job_mut(uuid, |job| {
            job.trigger(StartRequest {
                archive_type,
                schedule_uuid: None,
                custom_text,
                test_created,
                no_storage,
                dry_run,
                due_at: floor_to_minute(Utc::now()),
                actor,
            })
        })
        .await?;
    if !triggered {
        return Err(ServerError::JobRunning(uuid.to_string()));
    }

    // A new archive of this type is imminent: let the persistence engine
    // expire immediately.
    ctx.kernel.triggers.persistence.signal();
    Ok(ValueMap::new())
}

/// `jobAbort jobUUID=…`.
pub async fn job_abort(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let actor = ctx.session.handle.name();

    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            match job.running_info.state {
                // Not yet picked up by the runner: abort directly.
                JobState::Waiting => {
                    job.start_request = None;
                    job.running_info.state = JobState::Aborted;
                    job.running_info.abort_actor = actor.clone();
                }
                JobState::Running => job.request_abort(actor.clone()),
                _ => {}
            }
        })
        .await?;
    Ok(ValueMap::new())
}

/// `jobReset jobUUID=…` — clear the in-memory run info of an inactive job.
/// Persisted history rows are kept.
pub async fn job_reset(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job_mut(uuid, |job| {
            if job.is_active() {
                return Err(ServerError::JobRunning(job.name.clone()));
            }
            job.running_info = Default::default();
            job.last_error_code = 0;
            job.last_error_message.clear();
            Ok(())
        })
        .await??;
    Ok(ValueMap::new())
}

/// `jobStatus jobUUID=…` — transient run information.
pub async fn job_status(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    ctx.kernel
        .jobs
        .with_job(uuid, |job| {
            let info = &job.running_info;
            let mut data = ValueMap::new()
                .with("state", info.state)
                .with("doneCount", info.progress.done_count)
                .with("doneSize", info.progress.done_size)
                .with("totalCount", info.progress.total_count)
                .with("totalSize", info.progress.total_size)
                .with("storageDoneSize", info.progress.storage_done_size)
                .with("storageTotalSize", info.progress.storage_total_size)
                .with("currentEntry", &info.current_entry_name)
                .with("entriesPerSecond", format!("{:.1}", info.entries_per_second()))
                .with("bytesPerSecond", format!("{:.1}", info.bytes_per_second()))
                .with(
                    "storageBytesPerSecond",
                    format!("{:.1}", info.storage_bytes_per_second()),
                )
                .with("message", &info.message.text);
            let rest = info.estimated_rest_time();
            if rest != std::time::Duration::MAX {
                data.set("estimatedRestTime", rest.as_secs());
            }
            if let VolumeRequest::Requested {
                volume_number,
                message,
            } = &info.volume_request
            {
                data.set("volumeRequest", volume_number);
                data.set("volumeMessage", message);
            }
            data
        })
        .await
}

/// `jobOptionGet jobUUID=… name=…`.
pub async fn job_option_get(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let name = ctx.args.get_str("name")?.to_string();
    let value = ctx
        .kernel
        .jobs
        .with_job(uuid, move |job| job.option_get(&name))
        .await??;
    Ok(ValueMap::new().with("value", value))
}

/// `jobOptionSet jobUUID=… name=… value=…`.
pub async fn job_option_set(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let name = ctx.args.get_str("name")?.to_string();
    let value = ctx.args.get_str("value")?.to_string();
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| job.option_set(&name, &value))
        .await??;
    Ok(ValueMap::new())
}

/// `jobOptionDelete jobUUID=… name=…`.
pub async fn job_option_delete(ctx: Arc<CommandContext>) -> ServerResult<ValueMap> {
    let uuid = job_uuid_arg(&ctx)?;
    let name = ctx.args.get_str("name")?.to_string();
    ctx.kernel
        .jobs
        .with_job_mut(uuid, move |job| job.option_delete(&name))
        .await??;
    Ok(ValueMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ServerMode;
    use crate::kernel::clients::Authorization;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::server::dispatcher::Dispatcher;
    use crate::server::session::SessionState;
    use tokio::sync::mpsc;
    use wireline::{CommandFrame, ResultFrame, WireCode};

    struct Harness {
        deps: TestDependencies,
        dispatcher: Dispatcher,
        session: Arc<SessionState>,
    }

    impl Harness {
        fn new() -> Self {
            let deps = TestDependencies::new(ServerMode::Master);
            let handle = deps.kernel.clients.register("operator", Utc::now());
            handle.set_authorization(Authorization::Client);
            let session = SessionState::new(handle, "operator", false).unwrap();
            Self {
                deps,
                dispatcher: Dispatcher::new(),
                session,
            }
        }

        async fn run(&self, name: &str, args: ValueMap) -> ResultFrame {
            let (tx, _rx) = mpsc::unbounded_channel();
            self.dispatcher
                .execute(
                    self.deps.kernel.clone(),
                    self.session.clone(),
                    CommandFrame::with_args(1, name, args),
                    tx,
                )
                .await
        }
    }

    #[tokio::test]
    async fn test_job_new_creates_file_and_rejects_duplicate() {
        let h = Harness::new();
        let reply = h.run("jobNew", ValueMap::new().with("name", "nightly")).await;
        assert!(reply.code.is_ok());
        assert!(h.deps.kernel.config.jobs_directory.join("nightly").exists());

        let reply = h.run("jobNew", ValueMap::new().with("name", "nightly")).await;
        assert_eq!(reply.code, WireCode::JobAlreadyExists);
    }

    #[tokio::test]
    async fn test_job_option_round_trip() {
        let h = Harness::new();
        let reply = h.run("jobNew", ValueMap::new().with("name", "j")).await;
        let uuid = reply.data.get_str("jobUUID").unwrap().to_string();

        let reply = h
            .run(
                "jobOptionSet",
                ValueMap::new()
                    .with("jobUUID", &uuid)
                    .with("name", "archive-name")
                    .with("value", "sftp://h/backup.bar"),
            )
            .await;
        assert!(reply.code.is_ok());

        let reply = h
            .run(
                "jobOptionGet",
                ValueMap::new().with("jobUUID", &uuid).with("name", "archive-name"),
            )
            .await;
        assert_eq!(reply.data.get_str("value").unwrap(), "sftp://h/backup.bar");
    }

    #[tokio::test]
    async fn test_job_start_triggers_and_rejects_double_start() {
        let h = Harness::new();
        let reply = h.run("jobNew", ValueMap::new().with("name", "j")).await;
        let uuid = reply.data.get_str("jobUUID").unwrap().to_string();

        let reply = h
            .run(
                "jobStart",
                ValueMap::new().with("jobUUID", &uuid).with("archiveType", "FULL"),
            )
            .await;
        assert!(reply.code.is_ok());

        let reply = h
            .run(
                "jobStart",
                ValueMap::new().with("jobUUID", &uuid).with("archiveType", "FULL"),
            )
            .await;
        assert_eq!(reply.code, WireCode::JobRunning);
    }

    #[tokio::test]
    async fn test_job_delete_refused_while_active() {
        let h = Harness::new();
        let reply = h.run("jobNew", ValueMap::new().with("name", "j")).await;
        let uuid = reply.data.get_str("jobUUID").unwrap().to_string();
        h.run(
            "jobStart",
            ValueMap::new().with("jobUUID", &uuid).with("archiveType", "FULL"),
        )
        .await;

        let reply = h.run("jobDelete", ValueMap::new().with("jobUUID", &uuid)).await;
        assert_eq!(reply.code, WireCode::JobRunning);

        // After an abort the job is deletable.
        h.run("jobAbort", ValueMap::new().with("jobUUID", &uuid)).await;
        let reply = h.run("jobDelete", ValueMap::new().with("jobUUID", &uuid)).await;
        assert!(reply.code.is_ok());
    }

    #[tokio::test]
    async fn test_job_reset_requires_inactive() {
        let h = Harness::new();
        let reply = h.run("jobNew", ValueMap::new().with("name", "j")).await;
        let uuid = reply.data.get_str("jobUUID").unwrap().to_string();
        h.run(
            "jobStart",
            ValueMap::new().with("jobUUID", &uuid).with("archiveType", "FULL"),
        )
        .await;

        let reply = h.run("jobReset", ValueMap::new().with("jobUUID", &uuid)).await;
        assert_eq!(reply.code, WireCode::JobRunning);

        h.run("jobAbort", ValueMap::new().with("jobUUID", &uuid)).await;
        let reply = h.run("jobReset", ValueMap::new().with("jobUUID", &uuid)).await;
        assert!(reply.code.is_ok());

        let state = h
            .deps
            .kernel
            .jobs
            .with_job(uuid.parse().unwrap(), |j| j.running_info.state)
            .await
            .unwrap();
        assert_eq!(state, JobState::None);
    }

    #[tokio::test]
    async fn test_job_clone_gets_fresh_identities() {
        let h = Harness::new();
        let reply = h.run("jobNew", ValueMap::new().with("name", "src")).await;
        let uuid = reply.data.get_str("jobUUID").unwrap().to_string();

        let reply = h
            .run(
                "jobClone",
                ValueMap::new().with("jobUUID", &uuid).with("name", "copy"),
            )
            .await;
        assert!(reply.code.is_ok());
        let clone_uuid = reply.data.get_str("jobUUID").unwrap();
        assert_ne!(clone_uuid, uuid);
        assert!(h.deps.kernel.config.jobs_directory.join("copy").exists());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let h = Harness::new();
        let reply = h
            .run(
                "jobInfo",
                ValueMap::new().with("jobUUID", Uuid::new_v4()),
            )
            .await;
        assert_eq!(reply.code, WireCode::JobNotFound);
    }
}
