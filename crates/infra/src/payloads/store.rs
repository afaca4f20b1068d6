//! Status rows of staged payload files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailhaus_core::{DomainError, PayloadFileId};

use super::types::{PayloadFile, PayloadStatus};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload file not found: {0}")]
    NotFound(PayloadFileId),
    #[error("invalid payload state: {0}")]
    InvalidState(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable payload {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl PayloadError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<DomainError> for PayloadError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => PayloadError::InvalidState(msg),
            other => PayloadError::Storage(other.to_string()),
        }
    }
}

/// Persistence of [`PayloadFile`] rows.
#[async_trait]
pub trait PayloadFileStore: Send + Sync {
    async fn insert(&self, file: PayloadFile) -> Result<(), PayloadError>;

    async fn get(&self, id: PayloadFileId) -> Result<Option<PayloadFile>, PayloadError>;

    /// PENDING files, oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<PayloadFile>, PayloadError>;

    /// PENDING files created before `cutoff`, oldest first.
    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<PayloadFile>, PayloadError>;

    /// PROCESSED files created before `cutoff`.
    async fn processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PayloadFile>, PayloadError>;

    /// PENDING or FAILED → PROCESSED.
    async fn mark_processed(&self, id: PayloadFileId) -> Result<(), PayloadError>;

    /// PENDING or FAILED → FAILED.
    async fn mark_failed(&self, id: PayloadFileId, error: &str) -> Result<(), PayloadError>;

    async fn delete(&self, id: PayloadFileId) -> Result<(), PayloadError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPayloadFileStore {
    files: Mutex<HashMap<PayloadFileId, PayloadFile>>,
}

impl InMemoryPayloadFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PayloadFileId, PayloadFile>>, PayloadError> {
        self.files
            .lock()
            .map_err(|_| PayloadError::Storage("payload store lock poisoned".to_string()))
    }

    fn filtered(
        &self,
        pred: impl Fn(&PayloadFile) -> bool,
    ) -> Result<Vec<PayloadFile>, PayloadError> {
        let mut out: Vec<_> = self.lock()?.values().filter(|f| pred(f)).cloned().collect();
        out.sort_by_key(|f| (f.created_at, f.batch_number));
        Ok(out)
    }
}

#[async_trait]
impl PayloadFileStore for InMemoryPayloadFileStore {
    async fn insert(&self, file: PayloadFile) -> Result<(), PayloadError> {
        let mut files = self.lock()?;
        if files.contains_key(&file.id) {
            return Err(PayloadError::InvalidState(format!(
                "payload file {} already exists",
                file.id
            )));
        }
        files.insert(file.id, file);
        Ok(())
    }

    async fn get(&self, id: PayloadFileId) -> Result<Option<PayloadFile>, PayloadError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<PayloadFile>, PayloadError> {
        let mut out = self.filtered(|f| f.status == PayloadStatus::Pending)?;
        out.truncate(limit);
        Ok(out)
    }

    async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<PayloadFile>, PayloadError> {
        self.filtered(|f| f.status == PayloadStatus::Pending && f.created_at < cutoff)
    }

    async fn processed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PayloadFile>, PayloadError> {
        self.filtered(|f| f.status == PayloadStatus::Processed && f.created_at < cutoff)
    }

    async fn mark_processed(&self, id: PayloadFileId) -> Result<(), PayloadError> {
        let mut files = self.lock()?;
        let file = files.get_mut(&id).ok_or(PayloadError::NotFound(id))?;
        file.mark_processed(Utc::now())?;
        Ok(())
    }

    async fn mark_failed(&self, id: PayloadFileId, error: &str) -> Result<(), PayloadError> {
        let mut files = self.lock()?;
        let file = files.get_mut(&id).ok_or(PayloadError::NotFound(id))?;
        file.mark_failed(error)?;
        Ok(())
    }

    async fn delete(&self, id: PayloadFileId) -> Result<(), PayloadError> {
        self.lock()?.remove(&id);
        Ok(())
    }
}
