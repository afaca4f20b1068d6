//! Operator-facing job operations: create, inspect, retry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use mailhaus_core::{BatchJobId, CampaignId, DomainError, UserId};
use mailhaus_providers::{Criteria, ProviderCode, ProviderError, ProviderRegistry};

use super::store::{BatchJobStore, JobStoreError};
use super::types::{BatchJob, BatchJobStatus, JobLogEntry, JobStats, LogLevel, NewBatchJob};

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// A list or campaign processing request as submitted by an operator.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub provider: ProviderCode,
    /// Raw criteria document; validated before the job is stored.
    pub criteria: Value,
    pub campaign_id: Option<CampaignId>,
    pub created_by: Option<UserId>,
}

#[derive(Clone)]
pub struct BatchJobService {
    store: Arc<dyn BatchJobStore>,
    providers: ProviderRegistry,
}

impl BatchJobService {
    pub fn new(store: Arc<dyn BatchJobStore>, providers: ProviderRegistry) -> Self {
        Self { store, providers }
    }

    /// Validate and queue a new PENDING job.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<BatchJob, JobServiceError> {
        let criteria = Criteria::from_value(request.criteria)?;
        let provider = self.providers.get(request.provider)?;
        if !provider.is_configured() {
            warn!(provider = %request.provider, "queueing job for an unconfigured provider");
        }

        let job = NewBatchJob {
            provider: request.provider,
            criteria,
            campaign_id: request.campaign_id,
            created_by: request.created_by,
        }
        .into_job(Utc::now());

        self.store.insert(job.clone()).await?;
        self.store
            .append_log(JobLogEntry::new(job.id, LogLevel::Info, "job created"))
            .await?;
        info!(job_id = %job.id, provider = %job.provider, "batch job created");
        Ok(job)
    }

    pub async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobServiceError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(
        &self,
        status: Option<BatchJobStatus>,
        limit: usize,
    ) -> Result<Vec<BatchJob>, JobServiceError> {
        Ok(self.store.list(status, limit).await?)
    }

    pub async fn logs(&self, id: BatchJobId, limit: usize) -> Result<Vec<JobLogEntry>, JobServiceError> {
        Ok(self.store.logs(id, limit).await?)
    }

    /// Send a FAILED job back to the queue with a fresh attempt budget.
    pub async fn retry_failed_job(&self, id: BatchJobId) -> Result<BatchJob, JobServiceError> {
        let job = self.store.retry_failed(id).await?;
        self.store
            .append_log(JobLogEntry::new(id, LogLevel::Info, "job re-queued by operator"))
            .await?;
        info!(job_id = %id, "failed job re-queued");
        Ok(job)
    }

    pub async fn stats(&self) -> Result<JobStats, JobServiceError> {
        Ok(self.store.stats().await?)
    }
}

impl core::fmt::Debug for BatchJobService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchJobService")
            .field("providers", &self.providers)
            .finish()
    }
}
