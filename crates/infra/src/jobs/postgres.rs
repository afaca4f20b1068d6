//! Postgres-backed batch job store.
//!
//! ## Claim
//!
//! `claim_next` is a single statement:
//!
//! ```sql
//! UPDATE batch_jobs SET status = 'PROCESSING', attempts = attempts + 1,
//!     lease_expires_at = now() + make_interval(secs => $2), ...
//! WHERE job_id = (
//!     SELECT job_id FROM batch_jobs
//!     WHERE (status = 'PENDING' AND attempts < $1
//!            AND (next_attempt_at IS NULL OR next_attempt_at <= now()))
//!        OR (status = 'PROCESSING'
//!            AND (lease_expires_at IS NULL OR lease_expires_at <= now()))
//!     ORDER BY created_at
//!     LIMIT 1
//!     FOR UPDATE SKIP LOCKED
//! )
//! RETURNING ...
//! ```
//!
//! Concurrent pollers skip rows another transaction has locked, so a job is
//! handed to exactly one of them. A PROCESSING row whose lease lapsed belongs
//! to a worker that died mid-job; it is claimed again like a PENDING row.
//! Progress updates push the lease forward.
//!
//! ## Guarded transitions
//!
//! Every other update carries its source status in the `WHERE` clause. Zero
//! affected rows means the job is missing or in another state, which is
//! reported as `NotFound` or `InvalidState` after a follow-up lookup.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use async_trait::async_trait;
use mailhaus_core::{BatchJobId, CampaignId, UserId};
use mailhaus_providers::{Criteria, ProviderCode};

use super::store::{BatchJobStore, JobStoreError};
use super::types::{BatchJob, BatchJobStatus, JobLogEntry, JobProgress, JobStats, LogLevel};

const JOB_COLUMNS: &str = r#"
    job_id, status, provider, criteria, campaign_id,
    total_records, processed_records, success_count, error_count,
    error_details, attempts, next_attempt_at, lease_expires_at, created_by,
    created_at, updated_at, started_at, completed_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresBatchJobStore {
    pool: PgPool,
}

impl PostgresBatchJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update touched no rows.
    async fn transition_miss(&self, id: BatchJobId, op: &str) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(job)) => JobStoreError::InvalidState(format!(
                "cannot {op} job {id} in status {}",
                job.status
            )),
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn guarded(
        &self,
        id: BatchJobId,
        op: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        if result.rows_affected() == 0 {
            return Err(self.transition_miss(id, op).await);
        }
        Ok(())
    }
}

#[async_trait]
impl BatchJobStore for PostgresBatchJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: BatchJob) -> Result<BatchJobId, JobStoreError> {
        Span::current().record("operation", "insert_job");

        let result = sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                job_id, status, provider, criteria, campaign_id,
                total_records, processed_records, success_count, error_count,
                error_details, attempts, next_attempt_at, created_by,
                created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.provider.as_str())
        .bind(job.criteria.as_value())
        .bind(job.campaign_id.map(uuid::Uuid::from))
        .bind(to_i64(job.progress.total_records()))
        .bind(to_i64(job.progress.processed_records()))
        .bind(to_i64(job.progress.success_count()))
        .bind(to_i64(job.progress.error_count()))
        .bind(job.error_details.as_deref())
        .bind(job.attempts as i32)
        .bind(job.next_attempt_at)
        .bind(job.created_by.map(uuid::Uuid::from))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert_job", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE job_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        status: Option<BatchJobStatus>,
        limit: usize,
    ) -> Result<Vec<BatchJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM batch_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(BatchJobStatus::as_str))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        max_attempts: u32,
        lease: Duration,
    ) -> Result<Option<BatchJob>, JobStoreError> {
        Span::current().record("operation", "claim_next");

        let row = sqlx::query(&format!(
            r#"
            UPDATE batch_jobs
            SET status = 'PROCESSING',
                attempts = attempts + 1,
                next_attempt_at = NULL,
                lease_expires_at = now() + make_interval(secs => $2),
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE job_id = (
                SELECT job_id FROM batch_jobs
                WHERE (status = 'PENDING'
                       AND attempts < $1
                       AND (next_attempt_at IS NULL OR next_attempt_at <= now()))
                   OR (status = 'PROCESSING'
                       AND (lease_expires_at IS NULL OR lease_expires_at <= now()))
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(max_attempts as i32)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, progress), fields(job_id = %id), err)]
    async fn update_progress(
        &self,
        id: BatchJobId,
        progress: JobProgress,
        lease: Duration,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET total_records = $2, processed_records = $3,
                success_count = $4, error_count = $5,
                lease_expires_at = now() + make_interval(secs => $6),
                updated_at = now()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(*id.as_uuid())
        .bind(to_i64(progress.total_records()))
        .bind(to_i64(progress.processed_records()))
        .bind(to_i64(progress.success_count()))
        .bind(to_i64(progress.error_count()))
        .bind(lease.as_secs_f64());
        self.guarded(id, "update progress of", query).await
    }

    #[instrument(skip(self, progress), fields(job_id = %id), err)]
    async fn complete(&self, id: BatchJobId, progress: JobProgress) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'COMPLETED', total_records = $2, processed_records = $3,
                success_count = $4, error_count = $5, error_details = NULL,
                lease_expires_at = NULL, completed_at = now(), updated_at = now()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(*id.as_uuid())
        .bind(to_i64(progress.total_records()))
        .bind(to_i64(progress.processed_records()))
        .bind(to_i64(progress.success_count()))
        .bind(to_i64(progress.error_count()));
        self.guarded(id, "complete", query).await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail(&self, id: BatchJobId, error: &str) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'FAILED', error_details = $2, lease_expires_at = NULL,
                completed_at = now(), updated_at = now()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(*id.as_uuid())
        .bind(error.to_string());
        self.guarded(id, "fail", query).await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn requeue(
        &self,
        id: BatchJobId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'PENDING', error_details = $2, next_attempt_at = $3,
                lease_expires_at = NULL, updated_at = now()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(*id.as_uuid())
        .bind(error.to_string())
        .bind(next_attempt_at);
        self.guarded(id, "requeue", query).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: BatchJobId) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'PENDING', attempts = GREATEST(attempts - 1, 0),
                next_attempt_at = NULL, lease_expires_at = NULL, updated_at = now()
            WHERE job_id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(*id.as_uuid());
        self.guarded(id, "release", query).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_failed(&self, id: BatchJobId) -> Result<BatchJob, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE batch_jobs
            SET status = 'PENDING', attempts = 0, next_attempt_at = NULL,
                error_details = NULL, completed_at = NULL, updated_at = now()
            WHERE job_id = $1 AND status = 'FAILED'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_failed", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_miss(id, "retry").await),
        }
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id), err)]
    async fn append_log(&self, entry: JobLogEntry) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO batch_job_logs (job_id, level, message, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.job_id.as_uuid())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn logs(&self, id: BatchJobId, limit: usize) -> Result<Vec<JobLogEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, level, message, created_at
            FROM batch_job_logs
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_logs", e))?;

        rows.iter()
            .map(|row| -> Result<JobLogEntry, JobStoreError> {
                let level: String = row.try_get("level").map_err(decode_error)?;
                Ok(JobLogEntry {
                    job_id: BatchJobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
                    level: LogLevel::parse(&level)?,
                    message: row.try_get("message").map_err(decode_error)?,
                    created_at: row.try_get("created_at").map_err(decode_error)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM batch_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            let n = n.max(0) as u64;
            match BatchJobStatus::parse(&status)? {
                BatchJobStatus::Pending => stats.pending = n,
                BatchJobStatus::Processing => stats.processing = n,
                BatchJobStatus::Completed => stats.completed = n,
                BatchJobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

fn job_from_row(row: &PgRow) -> Result<BatchJob, JobStoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let provider: String = row.try_get("provider").map_err(decode_error)?;
    let criteria: serde_json::Value = row.try_get("criteria").map_err(decode_error)?;
    let campaign_id: Option<uuid::Uuid> = row.try_get("campaign_id").map_err(decode_error)?;
    let created_by: Option<uuid::Uuid> = row.try_get("created_by").map_err(decode_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode_error)?;

    let count = |col: &str| -> Result<u64, JobStoreError> {
        let v: i64 = row.try_get(col).map_err(decode_error)?;
        Ok(v.max(0) as u64)
    };
    let progress = JobProgress::from_counts(
        count("total_records")?,
        count("processed_records")?,
        count("success_count")?,
        count("error_count")?,
    )?;

    Ok(BatchJob {
        id: BatchJobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
        status: BatchJobStatus::parse(&status)?,
        provider: provider.parse::<ProviderCode>()?,
        criteria: Criteria::from_value(criteria)?,
        campaign_id: campaign_id.map(CampaignId::from_uuid),
        progress,
        error_details: row.try_get("error_details").map_err(decode_error)?,
        attempts: attempts.max(0) as u32,
        next_attempt_at: row.try_get("next_attempt_at").map_err(decode_error)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(decode_error)?,
        created_by: created_by.map(UserId::from_uuid),
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        started_at: row.try_get("started_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
    })
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
