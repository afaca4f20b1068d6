use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailhaus_core::{BatchJobId, DomainError, DomainResult, PayloadFileId};
use mailhaus_providers::ProviderCode;

/// Stored processing state of a staged page.
///
/// "Stuck" is not a status: it is a PENDING file older than a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadStatus {
    Pending,
    Processed,
    Failed,
}

impl PayloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadStatus::Pending => "PENDING",
            PayloadStatus::Processed => "PROCESSED",
            PayloadStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        [
            PayloadStatus::Pending,
            PayloadStatus::Processed,
            PayloadStatus::Failed,
        ]
        .into_iter()
        .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| DomainError::validation(format!("unknown payload status: {s}")))
    }
}

impl core::fmt::Display for PayloadStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status row of one staged page on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub id: PayloadFileId,
    pub file_path: PathBuf,
    pub provider: ProviderCode,
    pub job_id: Option<BatchJobId>,
    pub reference: String,
    pub batch_number: u32,
    pub record_count: u64,
    pub status: PayloadStatus,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl PayloadFile {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.status == PayloadStatus::Pending && self.age(now) > threshold
    }

    /// PENDING or FAILED → PROCESSED.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == PayloadStatus::Processed {
            return Err(DomainError::conflict(format!(
                "payload file {} is already processed",
                self.id
            )));
        }
        self.status = PayloadStatus::Processed;
        self.error_details = None;
        self.processed_at = Some(now);
        Ok(())
    }

    /// PENDING or FAILED → FAILED, keeping the latest error.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> DomainResult<()> {
        if self.status == PayloadStatus::Processed {
            return Err(DomainError::conflict(format!(
                "payload file {} is already processed",
                self.id
            )));
        }
        self.status = PayloadStatus::Failed;
        self.error_details = Some(error.into());
        Ok(())
    }
}

/// One provider page to stage.
#[derive(Debug, Clone)]
pub struct NewPayload {
    pub provider: ProviderCode,
    pub job_id: Option<BatchJobId>,
    /// Caller label carried into the file name, e.g. the job id or a list name.
    pub reference: String,
    pub batch_number: u32,
    pub records: Vec<serde_json::Value>,
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub dirs_removed: usize,
    pub errors: Vec<String>,
}
