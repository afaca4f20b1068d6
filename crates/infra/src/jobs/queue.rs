//! The batch job poll loop.
//!
//! One cycle:
//! 1. drain up to `files_per_cycle` leftover PENDING payload files;
//! 2. claim at most one job and run it page by page, staging each page to
//!    disk and ingesting it before fetching the next.
//!
//! Cycles never overlap: the loop awaits a cycle before sleeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use mailhaus_core::BatchJobId;
use mailhaus_providers::{FetchRequest, ProviderError, ProviderRegistry};

use super::store::{BatchJobStore, JobStoreError};
use super::types::{BatchJob, JobLogEntry, LogLevel, RetryPolicy};
use crate::config::QueueConfig;
use crate::dnm::DnmRegistry;
use crate::ingest::{BatchRunSummary, PropertyBatchService};
use crate::payloads::NewPayload;

/// What happened to the job claimed in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(BatchJobId),
    /// Retryable provider failure; back to PENDING with a backoff.
    Requeued(BatchJobId),
    Failed(BatchJobId),
    /// Shutdown requested; back to PENDING with the attempt handed back.
    Released(BatchJobId),
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub files: BatchRunSummary,
    pub job: Option<JobOutcome>,
}

/// Queue runtime counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub cycles: u64,
    pub jobs_completed: u64,
    pub jobs_requeued: u64,
    pub jobs_failed: u64,
    pub jobs_released: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub uptime_secs: u64,
}

impl QueueStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.files_processed += report.files.processed as u64;
        self.files_failed += report.files.failed as u64;
        match report.job {
            Some(JobOutcome::Completed(_)) => self.jobs_completed += 1,
            Some(JobOutcome::Requeued(_)) => self.jobs_requeued += 1,
            Some(JobOutcome::Failed(_)) => self.jobs_failed += 1,
            Some(JobOutcome::Released(_)) => self.jobs_released += 1,
            None => {}
        }
    }
}

/// Handle to a spawned queue loop.
#[derive(Debug)]
pub struct JobQueueHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<QueueStats>>,
}

impl JobQueueHandle {
    /// Request shutdown and wait for the in-flight cycle to wind down.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "job queue task ended abnormally");
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct JobQueue {
    jobs: Arc<dyn BatchJobStore>,
    ingest: PropertyBatchService,
    providers: ProviderRegistry,
    dnm: Arc<dyn DnmRegistry>,
    config: QueueConfig,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(
        jobs: Arc<dyn BatchJobStore>,
        ingest: PropertyBatchService,
        providers: ProviderRegistry,
        dnm: Arc<dyn DnmRegistry>,
        config: QueueConfig,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.max_attempts,
            ..RetryPolicy::default()
        };
        Self {
            jobs,
            ingest,
            providers,
            dnm,
            config,
            retry,
        }
    }

    /// Replace the backoff policy. Its `max_attempts` also bounds claiming.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the poll loop until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JobQueueHandle {
        let stats = Arc::new(Mutex::new(QueueStats::default()));
        let join = tokio::spawn(queue_loop(self, shutdown.clone(), stats.clone()));
        JobQueueHandle {
            shutdown,
            join,
            stats,
        }
    }

    /// One poll cycle.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport, JobStoreError> {
        let mut report = CycleReport::default();

        match self
            .ingest
            .process_pending_files(self.config.files_per_cycle)
            .await
        {
            Ok(summary) => report.files = summary,
            Err(e) => warn!(error = %e, "could not list pending payload files"),
        }

        if shutdown.is_cancelled() {
            return Ok(report);
        }

        let Some(job) = self
            .jobs
            .claim_next(self.retry.max_attempts, self.config.lease)
            .await? else {
            return Ok(report);
        };
        report.job = Some(self.process_job(job, shutdown).await?);
        Ok(report)
    }

    #[instrument(skip_all, fields(job_id = %job.id, provider = %job.provider, attempt = job.attempts))]
    async fn process_job(
        &self,
        job: BatchJob,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome, JobStoreError> {
        let id = job.id;
        info!("job claimed");

        // A job reclaimed from a lapsed lease may already be past its budget.
        if job.attempts > self.retry.max_attempts {
            let msg = format!(
                "lease lapsed after {} attempts; no attempts left",
                job.attempts - 1
            );
            self.jobs.fail(id, &msg).await?;
            error!(attempts = job.attempts, "abandoned job out of attempts");
            self.log(id, LogLevel::Error, format!("job failed: {msg}"))
                .await;
            return Ok(JobOutcome::Failed(id));
        }

        self.log(
            id,
            LogLevel::Info,
            format!("processing started (attempt {} of {})", job.attempts, self.retry.max_attempts),
        )
        .await;

        let provider = match self.providers.get(job.provider) {
            Ok(p) => p,
            Err(e) => return self.provider_failure(&job, e).await,
        };

        let page_size = provider.page_size().max(1);
        let fields = provider.default_fields();
        let mut progress = job.progress;
        let mut start = progress.processed_records();
        let mut batch = (start / page_size as u64) as u32 + 1;
        let mut suppressed_total = 0usize;

        if start > 0 {
            self.log(id, LogLevel::Info, format!("resuming at record {start}"))
                .await;
        }

        loop {
            if shutdown.is_cancelled() {
                self.jobs.release(id).await?;
                self.log(id, LogLevel::Warn, "shutdown requested; job released")
                    .await;
                info!(processed = progress.processed_records(), "job released on shutdown");
                return Ok(JobOutcome::Released(id));
            }

            let page = match provider
                .fetch_page(FetchRequest {
                    criteria: &job.criteria,
                    fields: &fields,
                    start,
                    limit: page_size,
                })
                .await
            {
                Ok(page) => page,
                Err(e) => return self.provider_failure(&job, e).await,
            };

            if let Some(total) = page.total {
                progress.set_total(total);
            }
            let fetched = page.records.len() as u64;
            if fetched == 0 {
                break;
            }

            let staged = self
                .ingest
                .payloads()
                .save_payload(NewPayload {
                    provider: job.provider,
                    job_id: Some(id),
                    reference: id.to_string(),
                    batch_number: batch,
                    records: page.records,
                })
                .await;
            let file = match staged {
                Ok(file) => file,
                Err(e) => {
                    let msg = format!("failed to stage page {batch}: {e}");
                    error!(batch, error = %e, "failed to stage page");
                    self.jobs
                        .update_progress(id, progress, self.config.lease)
                        .await?;
                    self.jobs.fail(id, &msg).await?;
                    self.log(id, LogLevel::Error, msg).await;
                    return Ok(JobOutcome::Failed(id));
                }
            };

            match self.ingest.process_file(&file).await {
                Ok(outcome) => {
                    progress.record_page(outcome.records, outcome.success, outcome.errors);
                    let suppressed = self.suppressed_count(&outcome.radar_ids).await;
                    suppressed_total += suppressed;
                    self.log(
                        id,
                        LogLevel::Info,
                        format!(
                            "page {batch}: {} records, {} stored, {} errors, {suppressed} suppressed by DNM",
                            outcome.records, outcome.success, outcome.errors
                        ),
                    )
                    .await;
                    if !outcome.status_recorded {
                        self.log(
                            id,
                            LogLevel::Warn,
                            format!("page {batch}: stored but file status not recorded; it will be re-ingested"),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    // process_file marked the file FAILED; the payload stays on disk.
                    progress.record_page(fetched, 0, fetched);
                    self.log(
                        id,
                        LogLevel::Error,
                        format!("page {batch}: ingestion failed: {e}"),
                    )
                    .await;
                }
            }
            self.jobs
                .update_progress(id, progress, self.config.lease)
                .await?;

            start += fetched;
            batch += 1;
            let exhausted =
                fetched < page_size as u64 || page.total.is_some_and(|t| start >= t);
            if exhausted {
                break;
            }
        }

        progress.finish();
        self.jobs.complete(id, progress).await?;
        let summary = format!(
            "completed: {} records, {} stored, {} errors, {suppressed_total} suppressed by DNM",
            progress.processed_records(),
            progress.success_count(),
            progress.error_count()
        );
        info!(
            records = progress.processed_records(),
            stored = progress.success_count(),
            errors = progress.error_count(),
            suppressed = suppressed_total,
            "job completed"
        );
        self.log(id, LogLevel::Info, summary).await;
        Ok(JobOutcome::Completed(id))
    }

    /// Requeue with backoff while retryable and attempts remain, else fail.
    async fn provider_failure(
        &self,
        job: &BatchJob,
        err: ProviderError,
    ) -> Result<JobOutcome, JobStoreError> {
        let msg = err.to_string();

        if err.is_retryable() && self.retry.should_retry(job.attempts) {
            let backoff = self.retry.delay_for_attempt(job.attempts);
            let delay = err.retry_after().map_or(backoff, |ra| ra.max(backoff));
            let next_attempt_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            self.jobs.requeue(job.id, &msg, next_attempt_at).await?;
            warn!(
                kind = err.kind().as_str(),
                error = %msg,
                retry_in_secs = delay.as_secs(),
                "provider error; job requeued"
            );
            self.log(
                job.id,
                LogLevel::Warn,
                format!("{msg}; retrying in {}s", delay.as_secs()),
            )
            .await;
            return Ok(JobOutcome::Requeued(job.id));
        }

        self.jobs.fail(job.id, &msg).await?;
        error!(kind = err.kind().as_str(), error = %msg, "job failed");
        self.log(job.id, LogLevel::Error, format!("job failed: {msg}"))
            .await;
        Ok(JobOutcome::Failed(job.id))
    }

    async fn suppressed_count(&self, radar_ids: &[mailhaus_properties::RadarId]) -> usize {
        match self.dnm.blocked_among(radar_ids).await {
            Ok(blocked) => blocked.len(),
            Err(e) => {
                warn!(error = %e, "dnm lookup failed");
                0
            }
        }
    }

    /// Job logs are best effort; a failed write never changes the outcome.
    async fn log(&self, id: BatchJobId, level: LogLevel, message: impl Into<String>) {
        if let Err(e) = self
            .jobs
            .append_log(JobLogEntry::new(id, level, message))
            .await
        {
            warn!(job_id = %id, error = %e, "failed to append job log");
        }
    }
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish()
    }
}

async fn queue_loop(queue: JobQueue, shutdown: CancellationToken, stats: Arc<Mutex<QueueStats>>) {
    info!(
        poll_interval_secs = queue.config.poll_interval.as_secs(),
        max_attempts = queue.retry.max_attempts,
        "job queue started"
    );
    let started = Instant::now();

    loop {
        match queue.run_cycle(&shutdown).await {
            Ok(report) => {
                debug!(job = ?report.job, files = report.files.processed, "cycle finished");
                if let Ok(mut s) = stats.lock() {
                    s.record(&report);
                    s.uptime_secs = started.elapsed().as_secs();
                }
            }
            Err(e) => error!(error = %e, "queue cycle failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(queue.config.poll_interval.max(Duration::from_millis(10))) => {}
        }
    }

    info!("job queue stopped");
}
