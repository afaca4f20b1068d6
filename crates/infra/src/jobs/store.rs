//! Batch job storage.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailhaus_core::{BatchJobId, DomainError};

use super::types::{BatchJob, BatchJobStatus, JobLogEntry, JobProgress, JobStats};

/// Batch job persistence.
///
/// Every state-changing method is a guarded transition: it only applies to a
/// job in the expected source status and returns
/// [`JobStoreError::InvalidState`] otherwise.
#[async_trait]
pub trait BatchJobStore: Send + Sync {
    async fn insert(&self, job: BatchJob) -> Result<BatchJobId, JobStoreError>;

    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError>;

    /// Newest first.
    async fn list(
        &self,
        status: Option<BatchJobStatus>,
        limit: usize,
    ) -> Result<Vec<BatchJob>, JobStoreError>;

    /// Atomically move the oldest claimable job to PROCESSING, increment its
    /// attempt counter and lease it for `lease`. Claimable means PENDING and
    /// due with attempts left, or PROCESSING with a lapsed lease (its worker
    /// died). Concurrent callers never receive the same job.
    async fn claim_next(
        &self,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Option<BatchJob>, JobStoreError>;

    /// Persist counters of a PROCESSING job and extend its lease by `lease`
    /// from now.
    async fn update_progress(
        &self,
        id: BatchJobId,
        progress: JobProgress,
        lease: Duration,
    ) -> Result<(), JobStoreError>;

    async fn complete(&self, id: BatchJobId, progress: JobProgress) -> Result<(), JobStoreError>;

    async fn fail(&self, id: BatchJobId, error: &str) -> Result<(), JobStoreError>;

    /// PROCESSING → PENDING, not claimable before `next_attempt_at`.
    async fn requeue(
        &self,
        id: BatchJobId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// PROCESSING → PENDING, handing the attempt back.
    async fn release(&self, id: BatchJobId) -> Result<(), JobStoreError>;

    /// FAILED → PENDING with the attempt counter reset.
    async fn retry_failed(&self, id: BatchJobId) -> Result<BatchJob, JobStoreError>;

    async fn append_log(&self, entry: JobLogEntry) -> Result<(), JobStoreError>;

    /// Oldest first.
    async fn logs(&self, id: BatchJobId, limit: usize) -> Result<Vec<JobLogEntry>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(BatchJobId),
    #[error("job already exists: {0}")]
    AlreadyExists(BatchJobId),
    #[error("invalid job state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) | DomainError::InvariantViolation(msg) => {
                JobStoreError::InvalidState(msg)
            }
            other => JobStoreError::Storage(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<BatchJobId, BatchJob>,
    logs: Vec<JobLogEntry>,
}

/// In-memory job store for tests/dev.
///
/// Claim is a select and update under one lock, which gives the same
/// exactly-once guarantee as the Postgres `SKIP LOCKED` claim.
#[derive(Debug, Default)]
pub struct InMemoryBatchJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryBatchJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn with_job<T>(
        &self,
        id: BatchJobId,
        f: impl FnOnce(&mut BatchJob) -> Result<T, DomainError>,
    ) -> Result<T, JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        // Apply to a copy so a rejected transition leaves the stored job intact.
        let mut updated = job.clone();
        let out = f(&mut updated)?;
        *job = updated;
        Ok(out)
    }
}

#[async_trait]
impl BatchJobStore for InMemoryBatchJobStore {
    async fn insert(&self, job: BatchJob) -> Result<BatchJobId, JobStoreError> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<BatchJobStatus>,
        limit: usize,
    ) -> Result<Vec<BatchJob>, JobStoreError> {
        let inner = self.lock()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn claim_next(
        &self,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Option<BatchJob>, JobStoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let lease_until = lease_until(now, lease);

        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now, max_attempts))
            .min_by_key(|j| (j.created_at, *j.id.as_uuid()))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.mark_processing(now, lease_until)?;
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        id: BatchJobId,
        progress: JobProgress,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        self.with_job(id, |job| {
            if job.status != BatchJobStatus::Processing {
                return Err(DomainError::conflict(format!(
                    "cannot update progress of job {id} in status {}",
                    job.status
                )));
            }
            let now = Utc::now();
            job.progress = progress;
            job.lease_expires_at = Some(lease_until(now, lease));
            job.updated_at = now;
            Ok(())
        })
    }

    async fn complete(&self, id: BatchJobId, progress: JobProgress) -> Result<(), JobStoreError> {
        self.with_job(id, |job| {
            job.progress = progress;
            job.mark_completed(Utc::now())
        })
    }

    async fn fail(&self, id: BatchJobId, error: &str) -> Result<(), JobStoreError> {
        self.with_job(id, |job| job.mark_failed(error, Utc::now()))
    }

    async fn requeue(
        &self,
        id: BatchJobId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.with_job(id, |job| job.requeue(error, next_attempt_at, Utc::now()))
    }

    async fn release(&self, id: BatchJobId) -> Result<(), JobStoreError> {
        self.with_job(id, |job| job.release(Utc::now()))
    }

    async fn retry_failed(&self, id: BatchJobId) -> Result<BatchJob, JobStoreError> {
        self.with_job(id, |job| {
            job.reset_for_retry(Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn append_log(&self, entry: JobLogEntry) -> Result<(), JobStoreError> {
        self.lock()?.logs.push(entry);
        Ok(())
    }

    async fn logs(&self, id: BatchJobId, limit: usize) -> Result<Vec<JobLogEntry>, JobStoreError> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|l| l.job_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.lock()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::jobs::types::LogLevel;
    use crate::jobs::types::tests::new_job;

    const LEASE: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryBatchJobStore::new();
        let id = store.insert(new_job()).await.unwrap();

        let claimed = store.claim_next(3, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, BatchJobStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        assert!(store.claim_next(3, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let store = InMemoryBatchJobStore::new();
        let mut older = new_job();
        older.created_at -= chrono::Duration::minutes(5);
        let older_id = store.insert(older).await.unwrap();
        store.insert(new_job()).await.unwrap();

        let claimed = store.claim_next(3, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, older_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_a_job_once() {
        let store = Arc::new(InMemoryBatchJobStore::new());
        store.insert(new_job()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_next(3, LEASE).await.unwrap() }));
        }

        let mut claimed = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(store.stats().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn exhausted_jobs_are_not_claimed() {
        let store = InMemoryBatchJobStore::new();
        let mut job = new_job();
        job.attempts = 3;
        store.insert(job).await.unwrap();

        assert!(store.claim_next(3, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_abandoned_by_a_dead_worker_is_reclaimed() {
        let store = InMemoryBatchJobStore::new();
        let id = store.insert(new_job()).await.unwrap();

        // Claimed with a lease that lapses at once, then never released.
        let first = store.claim_next(3, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.id, id);

        let second = store.claim_next(3, LEASE).await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.status, BatchJobStatus::Processing);
        assert_eq!(second.attempts, 2);

        // A live lease keeps other claimers away.
        assert!(store.claim_next(3, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_updates_extend_the_lease() {
        let store = InMemoryBatchJobStore::new();
        let id = store.insert(new_job()).await.unwrap();
        let claimed = store.claim_next(3, Duration::ZERO).await.unwrap().unwrap();

        store
            .update_progress(id, claimed.progress, LEASE)
            .await
            .unwrap();

        assert!(store.claim_next(3, LEASE).await.unwrap().is_none());
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.lease_expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn rejected_transition_leaves_job_untouched() {
        let store = InMemoryBatchJobStore::new();
        let id = store.insert(new_job()).await.unwrap();

        let err = store.fail(id, "boom").await.unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidState(_)));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, BatchJobStatus::Pending);
        assert_eq!(job.error_details, None);
    }

    #[tokio::test]
    async fn failed_job_retry_flow() {
        let store = InMemoryBatchJobStore::new();
        let id = store.insert(new_job()).await.unwrap();
        store.claim_next(3, LEASE).await.unwrap().unwrap();
        store.fail(id, "HTTP 400").await.unwrap();

        assert!(store.claim_next(3, LEASE).await.unwrap().is_none());

        let retried = store.retry_failed(id).await.unwrap();
        assert_eq!(retried.status, BatchJobStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(store.claim_next(3, LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn logs_are_per_job_in_order() {
        let store = InMemoryBatchJobStore::new();
        let a = store.insert(new_job()).await.unwrap();
        let b = store.insert(new_job()).await.unwrap();

        store.append_log(JobLogEntry::new(a, LogLevel::Info, "first")).await.unwrap();
        store.append_log(JobLogEntry::new(b, LogLevel::Warn, "other")).await.unwrap();
        store.append_log(JobLogEntry::new(a, LogLevel::Error, "second")).await.unwrap();

        let logs = store.logs(a, 10).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryBatchJobStore::new();
        for _ in 0..4 {
            store.insert(new_job()).await.unwrap();
        }
        store.claim_next(3, LEASE).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 1);
    }
}
