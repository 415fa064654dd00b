//! The process-wide job list.
//!
//! A single read/write lock with timed acquisition guards the list; a
//! notification wakes the runner whenever jobs or their states change.
//! Callers snapshot what they need and release the lock before calling
//! into the index or storage collaborators.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::model::Job;
use crate::common::error::{ServerError, ServerResult};

/// Default lock acquisition timeout. Failing to acquire means "busy"; the
/// caller backs off and retries.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock-protected job list plus its modification signal.
pub struct JobList {
    jobs: RwLock<Vec<Job>>,
    modified: Notify,
}

impl Default for JobList {
    fn default() -> Self {
        Self::new()
    }
}

impl JobList {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
            modified: Notify::new(),
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Read lock with the default timeout.
    pub async fn read(&self) -> ServerResult<RwLockReadGuard<'_, Vec<Job>>> {
        tokio::time::timeout(LOCK_TIMEOUT, self.jobs.read())
            .await
            .map_err(|_| ServerError::Failure("job list busy".to_string()))
    }

    /// Write lock with the default timeout.
    pub async fn write(&self) -> ServerResult<RwLockWriteGuard<'_, Vec<Job>>> {
        tokio::time::timeout(LOCK_TIMEOUT, self.jobs.write())
            .await
            .map_err(|_| ServerError::Failure("job list busy".to_string()))
    }

    /// Non-blocking write attempt, for advisory updates from sync contexts
    /// (progress callbacks drop their sample under contention).
    pub fn try_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, Vec<Job>>, tokio::sync::TryLockError> {
        self.jobs.try_write()
    }

    /// Signal that jobs or their states changed.
    pub fn signal_modified(&self) {
        self.modified.notify_waiters();
    }

    /// Wait for a modification signal, bounded by `timeout`.
    pub async fn wait_modified(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.modified.notified()).await;
    }

    /// Run a closure over the job with the given UUID under the read lock.
    pub async fn with_job<T>(
        &self,
        uuid: Uuid,
        f: impl FnOnce(&Job) -> T,
    ) -> ServerResult<T> {
        let jobs = self.read().await?;
        let job = jobs
            .iter()
            .find(|j| j.uuid == uuid)
            .ok_or_else(|| ServerError::JobNotFound(uuid.to_string()))?;
        Ok(f(job))
    }

    /// Run a closure over the job with the given UUID under the write lock,
    /// then signal the modification.
    pub async fn with_job_mut<T>(
        &self,
        uuid: Uuid,
        f: impl FnOnce(&mut Job) -> T,
    ) -> ServerResult<T> {
        let result = {
            let mut jobs = self.write().await?;
            let job = jobs
                .iter_mut()
                .find(|j| j.uuid == uuid)
                .ok_or_else(|| ServerError::JobNotFound(uuid.to_string()))?;
            f(job)
        };
        self.signal_modified();
        Ok(result)
    }

    /// Find a job UUID by name.
    pub async fn uuid_by_name(&self, name: &str) -> ServerResult<Option<Uuid>> {
        let jobs = self.read().await?;
        Ok(jobs.iter().find(|j| j.name == name).map(|j| j.uuid))
    }

    /// Snapshot of all job names.
    pub async fn names(&self) -> ServerResult<Vec<String>> {
        let jobs = self.read().await?;
        Ok(jobs.iter().map(|j| j.name.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn new_job(name: &str) -> Job {
        Job::new(name, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[tokio::test]
    async fn test_with_job_finds_by_uuid() {
        let list = JobList::new();
        let job = new_job("a");
        let uuid = job.uuid;
        list.write().await.unwrap().push(job);

        let name = list.with_job(uuid, |j| j.name.clone()).await.unwrap();
        assert_eq!(name, "a");
    }

    #[tokio::test]
    async fn test_with_job_unknown_uuid() {
        let list = JobList::new();
        let err = list.with_job(Uuid::new_v4(), |_| ()).await.unwrap_err();
        assert!(matches!(err, ServerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_modification_signal_wakes_waiter() {
        let list = Arc::new(JobList::new());
        let waiter = {
            let list = list.clone();
            tokio::spawn(async move {
                list.wait_modified(Duration::from_secs(5)).await;
            })
        };

        // Give the waiter a chance to park before signalling.
        tokio::task::yield_now().await;
        list.signal_modified();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_uuid_by_name() {
        let list = JobList::new();
        let job = new_job("nightly");
        let uuid = job.uuid;
        list.write().await.unwrap().push(job);

        assert_eq!(list.uuid_by_name("nightly").await.unwrap(), Some(uuid));
        assert_eq!(list.uuid_by_name("absent").await.unwrap(), None);
    }
}
