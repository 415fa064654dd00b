//! The job scheduler.
//!
//! Runs once per minute on minute boundaries. Each tick flushes modified
//! jobs and rescans the jobs directory when the reread timer expired,
//! snapshots the enabled schedules (so the job-list lock is not held during
//! evaluation), computes each schedule's due time, and triggers the job
//! when one is due and the job is not already active.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::delay::{delay, DelayOutcome};
use super::deps::ServerKernel;
use super::service_host::Service;
use crate::common::error::ServerResult;
use crate::domains::job::model::StartRequest;
use crate::domains::job::schedule::{due_at, floor_to_minute, Schedule};

/// How often modified jobs are flushed and the jobs directory rescanned.
const REREAD_JOBS_PERIOD: Duration = Duration::from_secs(300);

struct ScheduleSnapshot {
    job_uuid: Uuid,
    job_name: String,
    earliest_year: i32,
    schedule: Schedule,
}

/// The scheduler service.
pub struct Scheduler {
    kernel: Arc<ServerKernel>,
    last_reread: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self {
            kernel,
            last_reread: std::sync::Mutex::new(None),
        }
    }

    /// One scheduler tick at `now`. Public for tests.
    pub async fn tick(&self, now: DateTime<Utc>) -> ServerResult<()> {
        self.maybe_reread_jobs(now).await?;

        let snapshot = self.snapshot_schedules().await?;
        let now = floor_to_minute(now);

        for entry in snapshot {
            let pending = entry.schedule.archive_type
                == crate::common::types::ArchiveType::Continuous
                && self
                    .kernel
                    .continuous
                    .has_pending(entry.job_uuid, entry.schedule.uuid);

            let Some(due) = due_at(&entry.schedule, now, entry.earliest_year, pending) else {
                continue;
            };

            self.trigger_due_job(&entry, due, now).await?;
        }
        Ok(())
    }

    async fn snapshot_schedules(&self) -> ServerResult<Vec<ScheduleSnapshot>> {
        let jobs = self.kernel.jobs.read().await?;
        let mut snapshot = Vec::new();
        for job in jobs.iter() {
            for schedule in &job.schedules {
                if schedule.enabled {
                    snapshot.push(ScheduleSnapshot {
                        job_uuid: job.uuid,
                        job_name: job.name.clone(),
                        earliest_year: job.last_schedule_check.year(),
                        schedule: schedule.clone(),
                    });
                }
            }
        }
        Ok(snapshot)
    }

    async fn trigger_due_job(
        &self,
        entry: &ScheduleSnapshot,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ServerResult<()> {
        let mut jobs = self.kernel.jobs.write().await?;
        let Some(job) = jobs.iter_mut().find(|j| j.uuid == entry.job_uuid) else {
            return Ok(());
        };

        job.last_schedule_check = now;
        if job.is_active() {
            return Ok(());
        }

        let triggered = job.trigger(StartRequest {
            archive_type: entry.schedule.archive_type,
            schedule_uuid: Some(entry.schedule.uuid),
            custom_text: entry.schedule.custom_text.clone(),
            test_created: entry.schedule.test_created,
            no_storage: entry.schedule.no_storage,
            dry_run: false,
            due_at: due,
            actor: "scheduler".to_string(),
        });
        if triggered {
            info!(
                job = %entry.job_name,
                job_uuid = %entry.job_uuid,
                archive_type = %entry.schedule.archive_type,
                due = %due,
                "schedule triggered job"
            );
            drop(jobs);
            self.kernel.jobs.signal_modified();
        }
        Ok(())
    }

    async fn maybe_reread_jobs(&self, now: DateTime<Utc>) -> ServerResult<()> {
        {
            let mut last = self.last_reread.lock().unwrap();
            let due = last.is_none_or(|t| {
                (now - t).to_std().unwrap_or_default() >= REREAD_JOBS_PERIOD
            });
            if !due {
                return Ok(());
            }
            *last = Some(now);
        }
        self.flush_modified_jobs().await?;
        self.rescan_jobs(now).await
    }

    /// Write every modified job back to its config file.
    pub async fn flush_modified_jobs(&self) -> ServerResult<()> {
        // Serialize under the lock, write after releasing it.
        let to_write: Vec<crate::domains::job::Job> = {
            let mut jobs = self.kernel.jobs.write().await?;
            jobs.iter_mut()
                .filter(|j| j.modified)
                .map(|j| {
                    j.modified = false;
                    j.clone()
                })
                .collect()
        };

        for job in &to_write {
            if let Err(err) = self.kernel.job_store.write_job(job) {
                warn!(job = %job.name, error = %err, "cannot flush job file");
            }
        }
        Ok(())
    }

    /// Rescan the jobs directory and reconcile the in-memory list.
    pub async fn rescan_jobs(&self, now: DateTime<Utc>) -> ServerResult<()> {
        let known = self.kernel.jobs.names().await?;
        let outcome = self.kernel.job_store.rescan(&known, now)?;
        if outcome.added.is_empty() && outcome.updated.is_empty() && outcome.removed.is_empty() {
            return Ok(());
        }

        let mut jobs = self.kernel.jobs.write().await?;
        for added in outcome.added {
            if jobs.iter().any(|j| j.uuid == added.uuid) {
                warn!(job = %added.name, uuid = %added.uuid, "duplicate job UUID, file ignored");
                continue;
            }
            debug!(job = %added.name, "job added from directory");
            jobs.push(added);
        }
        for updated in outcome.updated {
            if let Some(job) = jobs.iter_mut().find(|j| j.uuid == updated.uuid) {
                if job.is_active() {
                    debug!(job = %job.name, "job active, deferring file reload");
                    continue;
                }
                // Keep transient state, adopt the new configuration.
                let mut updated = updated;
                updated.running_info = std::mem::take(&mut job.running_info);
                updated.last_schedule_check = job.last_schedule_check;
                updated.slave_state = job.slave_state;
                *job = updated;
            }
        }
        for removed in outcome.removed {
            // Active jobs and unflushed edits survive a vanished file; the
            // next flush recreates it.
            jobs.retain(|j| j.name != removed || j.is_active() || j.modified);
        }
        drop(jobs);
        self.kernel.jobs.signal_modified();
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let now = Utc::now();
            if let Err(err) = self.tick(now).await {
                warn!(error = %err, "scheduler tick failed");
            }

            // Sleep to the next minute boundary, or until triggered.
            let second = Utc::now().second() as u64;
            let to_boundary = Duration::from_secs(60 - second.min(59));
            if delay(
                to_boundary,
                Some(&self.kernel.triggers.scheduler),
                &shutdown,
            )
            .await
                == DelayOutcome::Quit
            {
                // Final flush so operator edits survive the shutdown.
                let _ = self.flush_modified_jobs().await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{ArchiveType, ServerMode};
    use crate::domains::job::model::Job;
    use crate::domains::job::running::JobState;
    use crate::domains::job::schedule::ScheduleTime;
    use crate::kernel::test_dependencies::TestDependencies;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    async fn job_with_full_at_0330(deps: &TestDependencies) -> Uuid {
        let mut job = Job::new("nightly", utc(2024, 1, 1, 0, 0));
        let mut schedule = Schedule::new(ArchiveType::Full);
        schedule.time = ScheduleTime {
            hour: Some(3),
            minute: Some(30),
        };
        job.schedules.push(schedule);
        let uuid = job.uuid;
        deps.kernel.job_store.write_job(&job).unwrap();
        deps.kernel.jobs.write().await.unwrap().push(job);
        uuid
    }

    #[tokio::test]
    async fn test_scheduled_full_backup_fires_once() {
        let deps = TestDependencies::new(ServerMode::Master);
        let scheduler = Scheduler::new(deps.kernel.clone());
        let uuid = job_with_full_at_0330(&deps).await;

        scheduler.tick(utc(2024, 6, 1, 3, 30)).await.unwrap();

        let (state, request) = deps
            .kernel
            .jobs
            .with_job(uuid, |j| (j.running_info.state, j.start_request.clone()))
            .await
            .unwrap();
        assert_eq!(state, JobState::Waiting);
        let request = request.expect("start request recorded");
        assert_eq!(request.archive_type, ArchiveType::Full);
        assert_eq!(request.due_at, utc(2024, 6, 1, 3, 30));
        assert_eq!(request.actor, "scheduler");
    }

    #[tokio::test]
    async fn test_no_second_trigger_while_active() {
        let deps = TestDependencies::new(ServerMode::Master);
        let scheduler = Scheduler::new(deps.kernel.clone());
        let uuid = job_with_full_at_0330(&deps).await;

        scheduler.tick(utc(2024, 6, 1, 3, 30)).await.unwrap();
        // Clear the request marker to observe a would-be re-trigger.
        deps.kernel
            .jobs
            .with_job_mut(uuid, |j| j.start_request = None)
            .await
            .unwrap();

        scheduler.tick(utc(2024, 6, 1, 3, 31)).await.unwrap();
        let request = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.start_request.clone())
            .await
            .unwrap();
        assert!(request.is_none(), "active job must not be re-triggered");
    }

    #[tokio::test]
    async fn test_no_new_trigger_after_run_completed() {
        let deps = TestDependencies::new(ServerMode::Master);
        let scheduler = Scheduler::new(deps.kernel.clone());
        let uuid = job_with_full_at_0330(&deps).await;

        scheduler.tick(utc(2024, 6, 1, 3, 30)).await.unwrap();

        // Simulate the runner completing the run.
        deps.kernel
            .jobs
            .with_job_mut(uuid, |j| {
                j.running_info.state = JobState::Done;
                j.start_request = None;
                j.schedules[0].last_executed = Some(utc(2024, 6, 1, 3, 30));
            })
            .await
            .unwrap();

        scheduler.tick(utc(2024, 6, 1, 3, 31)).await.unwrap();
        let (state, request) = deps
            .kernel
            .jobs
            .with_job(uuid, |j| (j.running_info.state, j.start_request.clone()))
            .await
            .unwrap();
        assert_eq!(state, JobState::Done);
        assert!(request.is_none());
    }

    #[tokio::test]
    async fn test_missed_run_triggers_late() {
        let deps = TestDependencies::new(ServerMode::Master);
        let scheduler = Scheduler::new(deps.kernel.clone());
        let uuid = job_with_full_at_0330(&deps).await;

        // The daemon slept through 03:30; at 06:12 the run is still due,
        // with the original due time.
        scheduler.tick(utc(2024, 6, 1, 6, 12)).await.unwrap();
        let request = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.start_request.clone())
            .await
            .unwrap()
            .expect("missed run triggered");
        assert_eq!(request.due_at, utc(2024, 6, 1, 3, 30));
    }

    #[tokio::test]
    async fn test_continuous_gated_by_change_log() {
        let deps = TestDependencies::new(ServerMode::Master);
        let scheduler = Scheduler::new(deps.kernel.clone());

        let mut job = Job::new("cont", utc(2024, 1, 1, 0, 0));
        let mut schedule = Schedule::new(ArchiveType::Continuous);
        schedule.interval_minutes = 10;
        let schedule_uuid = schedule.uuid;
        job.schedules.push(schedule);
        let uuid = job.uuid;
        deps.kernel.job_store.write_job(&job).unwrap();
        deps.kernel.jobs.write().await.unwrap().push(job);

        scheduler.tick(utc(2024, 6, 1, 12, 0)).await.unwrap();
        assert!(deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.start_request.clone())
            .await
            .unwrap()
            .is_none());

        deps.continuous.add_pending(uuid, schedule_uuid);
        scheduler.tick(utc(2024, 6, 1, 12, 1)).await.unwrap();
        let request = deps
            .kernel
            .jobs
            .with_job(uuid, |j| j.start_request.clone())
            .await
            .unwrap()
            .expect("pending change triggers continuous job");
        assert_eq!(request.archive_type, ArchiveType::Continuous);
    }
}
