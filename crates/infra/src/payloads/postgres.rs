//! Postgres-backed `property_payload_files` table.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use mailhaus_core::{BatchJobId, PayloadFileId};
use mailhaus_providers::ProviderCode;

use super::store::{PayloadError, PayloadFileStore};
use super::types::{PayloadFile, PayloadStatus};

const FILE_COLUMNS: &str = r#"
    id, file_path, provider, job_id, reference, batch_number, record_count,
    status, error_details, created_at, processed_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresPayloadFileStore {
    pool: PgPool,
}

impl PostgresPayloadFileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select(
        &self,
        operation: &str,
        filter: &str,
        cutoff: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<PayloadFile>, PayloadError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {FILE_COLUMNS} FROM property_payload_files
            WHERE {filter} AND ($1::timestamptz IS NULL OR created_at < $1)
            ORDER BY created_at ASC, batch_number ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter().map(file_from_row).collect()
    }

    async fn transition_miss(&self, id: PayloadFileId, op: &str) -> PayloadError {
        match self.get(id).await {
            Ok(Some(file)) => PayloadError::InvalidState(format!(
                "cannot {op} payload file {id} in status {}",
                file.status
            )),
            Ok(None) => PayloadError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl PayloadFileStore for PostgresPayloadFileStore {
    #[instrument(skip(self, file), fields(file_id = %file.id, path = %file.file_path.display()), err)]
    async fn insert(&self, file: PayloadFile) -> Result<(), PayloadError> {
        sqlx::query(
            r#"
            INSERT INTO property_payload_files (
                id, file_path, provider, job_id, reference, batch_number, record_count,
                status, error_details, created_at, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(file.id.as_uuid())
        .bind(file.file_path.to_string_lossy().into_owned())
        .bind(file.provider.as_str())
        .bind(file.job_id.map(uuid::Uuid::from))
        .bind(&file.reference)
        .bind(file.batch_number as i32)
        .bind(i64::try_from(file.record_count).unwrap_or(i64::MAX))
        .bind(file.status.as_str())
        .bind(file.error_details.as_deref())
        .bind(file.created_at)
        .bind(file.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_payload_file", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(file_id = %id), err)]
    async fn get(&self, id: PayloadFileId) -> Result<Option<PayloadFile>, PayloadError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM property_payload_files WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_payload_file", e))?;

        row.as_ref().map(file_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_pending(&self, limit: usize) -> Result<Vec<PayloadFile>, PayloadError> {
        self.select("list_pending", "status = 'PENDING'", None, limit as i64)
            .await
    }

    #[instrument(skip(self), err)]
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<PayloadFile>, PayloadError> {
        self.select("pending_before", "status = 'PENDING'", Some(cutoff), i64::MAX)
            .await
    }

    #[instrument(skip(self), err)]
    async fn processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PayloadFile>, PayloadError> {
        self.select("processed_before", "status = 'PROCESSED'", Some(cutoff), i64::MAX)
            .await
    }

    #[instrument(skip(self), fields(file_id = %id), err)]
    async fn mark_processed(&self, id: PayloadFileId) -> Result<(), PayloadError> {
        let result = sqlx::query(
            r#"
            UPDATE property_payload_files
            SET status = 'PROCESSED', error_details = NULL, processed_at = now()
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_miss(id, "process").await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(file_id = %id), err)]
    async fn mark_failed(&self, id: PayloadFileId, error: &str) -> Result<(), PayloadError> {
        let result = sqlx::query(
            r#"
            UPDATE property_payload_files
            SET status = 'FAILED', error_details = $2
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_miss(id, "fail").await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(file_id = %id), err)]
    async fn delete(&self, id: PayloadFileId) -> Result<(), PayloadError> {
        sqlx::query("DELETE FROM property_payload_files WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_payload_file", e))?;
        Ok(())
    }
}

fn file_from_row(row: &PgRow) -> Result<PayloadFile, PayloadError> {
    let path: String = row.try_get("file_path").map_err(decode_error)?;
    let provider: String = row.try_get("provider").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let job_id: Option<uuid::Uuid> = row.try_get("job_id").map_err(decode_error)?;
    let batch_number: i32 = row.try_get("batch_number").map_err(decode_error)?;
    let record_count: i64 = row.try_get("record_count").map_err(decode_error)?;

    Ok(PayloadFile {
        id: PayloadFileId::from_uuid(row.try_get("id").map_err(decode_error)?),
        file_path: PathBuf::from(path),
        provider: provider.parse::<ProviderCode>()?,
        job_id: job_id.map(BatchJobId::from_uuid),
        reference: row.try_get("reference").map_err(decode_error)?,
        batch_number: batch_number.max(0) as u32,
        record_count: record_count.max(0) as u64,
        status: PayloadStatus::parse(&status)?,
        error_details: row.try_get("error_details").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        processed_at: row.try_get("processed_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> PayloadError {
    PayloadError::Storage(format!("failed to decode payload file row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PayloadError {
    match err {
        sqlx::Error::Database(db_err) => {
            PayloadError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => PayloadError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
