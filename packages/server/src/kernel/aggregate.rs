//! Aggregate-info loader.
//!
//! Pulls per-job and per-schedule statistics out of the index and merges
//! them into the job list under the write lock. Called after every job run
//! and by the `jobInfo`/`scheduleList` commands.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use super::deps::ServerKernel;
use super::traits::IndexHandle;
use crate::common::error::ServerResult;

/// Refresh the aggregate info of one job and all of its schedules.
pub async fn refresh_job(
    kernel: &ServerKernel,
    handle: &IndexHandle,
    job_uuid: Uuid,
) -> ServerResult<()> {
    let aggregate = kernel.index.aggregate_for_job(handle, job_uuid).await?;

    let schedule_uuids = kernel
        .jobs
        .with_job(job_uuid, |job| {
            job.schedules.iter().map(|s| s.uuid).collect::<Vec<_>>()
        })
        .await?;

    let mut schedule_aggregates = HashMap::new();
    for schedule_uuid in schedule_uuids {
        match kernel
            .index
            .aggregate_for_schedule(handle, job_uuid, schedule_uuid)
            .await
        {
            Ok(aggregate) => {
                schedule_aggregates.insert(schedule_uuid, aggregate);
            }
            Err(err) => {
                debug!(schedule = %schedule_uuid, error = %err, "schedule aggregate unavailable")
            }
        }
    }

    kernel
        .jobs
        .with_job_mut(job_uuid, |job| {
            job.aggregate = aggregate;
            job.schedule_aggregates = schedule_aggregates;
        })
        .await
}

/// Refresh every job present in the index.
pub async fn refresh_all(kernel: &ServerKernel, handle: &IndexHandle) -> ServerResult<()> {
    for job_uuid in kernel.index.job_uuids(handle).await? {
        // Jobs deleted since the entity was written are fine to skip.
        let _ = refresh_job(kernel, handle, job_uuid).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{ArchiveType, ServerMode};
    use crate::domains::job::model::Job;
    use crate::domains::job::schedule::Schedule;
    use crate::kernel::test_dependencies::TestDependencies;
    use crate::kernel::traits::{Index, NewEntity};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_refresh_job_merges_totals() {
        let deps = TestDependencies::new(ServerMode::Master);
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut job = Job::new("stats", now);
        let schedule = Schedule::new(ArchiveType::Full);
        let schedule_uuid = schedule.uuid;
        job.schedules.push(schedule);
        let job_uuid = job.uuid;
        deps.kernel.jobs.write().await.unwrap().push(job);

        let handle = deps.index.open_handle().await.unwrap();
        let entity_id = deps
            .index
            .add_entity(
                &handle,
                NewEntity {
                    uuid: Uuid::new_v4(),
                    job_uuid,
                    schedule_uuid: Some(schedule_uuid),
                    created_at: now,
                    archive_type: ArchiveType::Full,
                },
            )
            .await
            .unwrap();
        deps.index
            .update_entity_totals(&handle, entity_id, 42, 4096)
            .await
            .unwrap();

        refresh_job(&deps.kernel, &handle, job_uuid).await.unwrap();

        let (aggregate, schedule_aggregate) = deps
            .kernel
            .jobs
            .with_job(job_uuid, |job| {
                (
                    job.aggregate.clone(),
                    job.schedule_aggregates.get(&schedule_uuid).copied(),
                )
            })
            .await
            .unwrap();
        assert_eq!(aggregate.totals(ArchiveType::Full).entry_count, 42);
        let schedule_aggregate = schedule_aggregate.unwrap();
        assert_eq!(schedule_aggregate.total_entity_count, 1);
        assert_eq!(schedule_aggregate.total_entry_size, 4096);
    }
}
