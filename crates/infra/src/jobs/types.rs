//! Batch job types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailhaus_core::{BatchJobId, CampaignId, DomainError, DomainResult, UserId};
use mailhaus_providers::{Criteria, ProviderCode};

/// Batch job lifecycle state.
///
/// `PENDING → PROCESSING → {COMPLETED, FAILED}`. A retryable failure sends a
/// PROCESSING job back to PENDING with a backoff; an operator may send a
/// FAILED job back to PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchJobStatus {
    pub const ALL: [BatchJobStatus; 4] = [
        BatchJobStatus::Pending,
        BatchJobStatus::Processing,
        BatchJobStatus::Completed,
        BatchJobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BatchJobStatus::Pending => "PENDING",
            BatchJobStatus::Processing => "PROCESSING",
            BatchJobStatus::Completed => "COMPLETED",
            BatchJobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchJobStatus::Completed | BatchJobStatus::Failed)
    }
}

impl core::fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record counters of a job.
///
/// Always `processed <= total` and `success + errors <= processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    total_records: u64,
    processed_records: u64,
    success_count: u64,
    error_count: u64,
}

impl JobProgress {
    /// Rebuild counters read back from storage.
    pub fn from_counts(total: u64, processed: u64, success: u64, errors: u64) -> DomainResult<Self> {
        if processed > total {
            return Err(DomainError::invariant(format!(
                "processed_records {processed} exceeds total_records {total}"
            )));
        }
        if success.saturating_add(errors) > processed {
            return Err(DomainError::invariant(format!(
                "success {success} + errors {errors} exceeds processed_records {processed}"
            )));
        }
        Ok(Self {
            total_records: total,
            processed_records: processed,
            success_count: success,
            error_count: errors,
        })
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn processed_records(&self) -> u64 {
        self.processed_records
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Record the provider-reported total. Never drops below what was
    /// already processed.
    pub fn set_total(&mut self, total: u64) {
        self.total_records = total.max(self.processed_records);
    }

    /// Account for one ingested page of `records` records.
    pub fn record_page(&mut self, records: u64, success: u64, errors: u64) {
        let success = success.min(records);
        let errors = errors.min(records - success);

        self.processed_records = self.processed_records.saturating_add(records);
        self.success_count = self.success_count.saturating_add(success);
        self.error_count = self.error_count.saturating_add(errors);
        if self.processed_records > self.total_records {
            self.total_records = self.processed_records;
        }
    }

    /// Pin the total to what was actually processed once the provider has
    /// nothing more to return.
    pub fn finish(&mut self) {
        self.total_records = self.processed_records;
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How many times a job is attempted and how long to wait in between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the attempt after `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter so two jobs failing together drift apart.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that has used `attempts` attempts may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A provider fetch/ingest job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: BatchJobId,
    pub status: BatchJobStatus,
    pub provider: ProviderCode,
    pub criteria: Criteria,
    pub campaign_id: Option<CampaignId>,
    pub progress: JobProgress,
    pub error_details: Option<String>,
    /// Claims so far. Incremented by every PENDING → PROCESSING transition.
    pub attempts: u32,
    /// Not claimable before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set while PROCESSING. Once it passes, the worker holding the job is
    /// presumed dead and the job may be claimed again.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// PENDING and due with attempts left, or PROCESSING with a lapsed lease.
    ///
    /// A lapsed job is claimable whatever its attempt count so that it never
    /// stays PROCESSING; the queue fails it if the budget is spent.
    pub fn is_claimable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.status {
            BatchJobStatus::Pending => {
                self.attempts < max_attempts && self.next_attempt_at.is_none_or(|at| at <= now)
            }
            BatchJobStatus::Processing => self.lease_expired(now),
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BatchJobStatus::Processing && self.lease_expires_at.is_none_or(|at| at <= now)
    }

    fn expect_status(&self, expected: BatchJobStatus, op: &str) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::conflict(format!(
                "cannot {op} job {} in status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Claim until `lease_until`. Also takes over a PROCESSING job whose
    /// lease has lapsed.
    pub fn mark_processing(
        &mut self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.lease_expired(now) {
            self.expect_status(BatchJobStatus::Pending, "claim")?;
        }
        self.status = BatchJobStatus::Processing;
        self.attempts += 1;
        self.next_attempt_at = None;
        self.lease_expires_at = Some(lease_until);
        self.started_at.get_or_insert(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(BatchJobStatus::Processing, "complete")?;
        self.status = BatchJobStatus::Completed;
        self.error_details = None;
        self.lease_expires_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(BatchJobStatus::Processing, "fail")?;
        self.status = BatchJobStatus::Failed;
        self.error_details = Some(error.into());
        self.lease_expires_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Back to PENDING after a retryable failure. The attempt is consumed.
    pub fn requeue(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_status(BatchJobStatus::Processing, "requeue")?;
        self.status = BatchJobStatus::Pending;
        self.error_details = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.lease_expires_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Back to PENDING on shutdown. The attempt is given back.
    pub fn release(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(BatchJobStatus::Processing, "release")?;
        self.status = BatchJobStatus::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.next_attempt_at = None;
        self.lease_expires_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Operator retry of a FAILED job. Counters are kept; ingestion is
    /// idempotent so already-stored pages are simply upserted again.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(BatchJobStatus::Failed, "retry")?;
        self.status = BatchJobStatus::Pending;
        self.attempts = 0;
        self.next_attempt_at = None;
        self.error_details = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }
}

/// Operator request to queue a job.
#[derive(Debug, Clone)]
pub struct NewBatchJob {
    pub provider: ProviderCode,
    pub criteria: Criteria,
    pub campaign_id: Option<CampaignId>,
    pub created_by: Option<UserId>,
}

impl NewBatchJob {
    pub fn into_job(self, now: DateTime<Utc>) -> BatchJob {
        BatchJob {
            id: BatchJobId::new(),
            status: BatchJobStatus::Pending,
            provider: self.provider,
            criteria: self.criteria,
            campaign_id: self.campaign_id,
            progress: JobProgress::default(),
            error_details: None,
            attempts: 0,
            next_attempt_at: None,
            lease_expires_at: None,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        [LogLevel::Info, LogLevel::Warn, LogLevel::Error]
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown log level: {s}")))
    }
}

/// One line of a job's operator-visible history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: BatchJobId,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl JobLogEntry {
    pub fn new(job_id: BatchJobId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn count(&mut self, status: BatchJobStatus) {
        match status {
            BatchJobStatus::Pending => self.pending += 1,
            BatchJobStatus::Processing => self.processing += 1,
            BatchJobStatus::Completed => self.completed += 1,
            BatchJobStatus::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    pub(crate) fn new_job() -> BatchJob {
        NewBatchJob {
            provider: ProviderCode::PropertyRadar,
            criteria: Criteria::from_value(json!([{"name": "State", "value": ["CA"]}])).unwrap(),
            campaign_id: None,
            created_by: None,
        }
        .into_job(Utc::now())
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn status_strings() {
        assert_eq!(BatchJobStatus::parse("processing").unwrap(), BatchJobStatus::Processing);
        assert_eq!(BatchJobStatus::Failed.to_string(), "FAILED");
        assert!(BatchJobStatus::parse("DONE").is_err());
    }

    fn lease(now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::minutes(10)
    }

    #[test]
    fn lapsed_lease_makes_processing_job_claimable_again() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now, lease(now)).unwrap();
        assert!(!job.is_claimable(now, 3));
        assert!(job.mark_processing(now, lease(now)).is_err());

        let after = lease(now) + chrono::Duration::seconds(1);
        assert!(job.is_claimable(after, 3));
        // Even with the budget spent, so it cannot stay PROCESSING forever.
        assert!(job.is_claimable(after, 1));

        job.mark_processing(after, lease(after)).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.lease_expires_at, Some(lease(after)));

        job.mark_completed(after).unwrap();
        assert_eq!(job.lease_expires_at, None);
        assert!(!job.is_claimable(lease(after) + chrono::Duration::hours(1), 3));
    }

    #[test]
    fn claim_and_release_do_not_consume_an_attempt() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now, lease(now)).unwrap();
        assert_eq!(job.attempts, 1);
        job.release(now).unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.status, BatchJobStatus::Pending);
    }

    #[test]
    fn requeue_keeps_attempt_and_delays() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now, lease(now)).unwrap();
        let later = now + chrono::Duration::seconds(30);
        job.requeue("HTTP 429", later, now).unwrap();
        assert_eq!(job.attempts, 1);
        assert!(!job.is_claimable(now, 3));
        assert!(job.is_claimable(later, 3));
        assert!(!job.is_claimable(later, 1));
    }

    #[test]
    fn terminal_jobs_reject_transitions() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now, lease(now)).unwrap();
        job.mark_completed(now).unwrap();
        assert!(job.mark_processing(now, lease(now)).is_err());
        assert!(job.reset_for_retry(now).is_err());
    }

    #[test]
    fn operator_retry_resets_attempts() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_processing(now, lease(now)).unwrap();
        job.mark_failed("HTTP 400", now).unwrap();
        job.reset_for_retry(now).unwrap();
        assert_eq!(job.status, BatchJobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.error_details, None);
    }

    #[test]
    fn from_counts_rejects_broken_counters() {
        assert!(JobProgress::from_counts(10, 11, 0, 0).is_err());
        assert!(JobProgress::from_counts(10, 5, 4, 2).is_err());
        assert!(JobProgress::from_counts(10, 5, 3, 2).is_ok());
    }

    proptest! {
        #[test]
        fn progress_invariants_hold(
            totals in proptest::collection::vec(0u64..2_000, 0..5),
            pages in proptest::collection::vec((0u64..600, 0u64..700, 0u64..700), 0..20),
        ) {
            let mut p = JobProgress::default();
            let mut totals = totals.into_iter();
            for (records, success, errors) in pages {
                if let Some(t) = totals.next() {
                    p.set_total(t);
                }
                p.record_page(records, success, errors);
                prop_assert!(p.processed_records() <= p.total_records());
                prop_assert!(p.success_count() + p.error_count() <= p.processed_records());
            }
            p.finish();
            prop_assert_eq!(p.processed_records(), p.total_records());
        }
    }
}
