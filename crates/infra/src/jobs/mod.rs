//! PropertyRadar batch jobs.
//!
//! A job is one criteria query worked page by page by the [`JobQueue`].
//! Jobs move PENDING → PROCESSING → COMPLETED | FAILED; retryable provider
//! failures send a job back to PENDING with a backoff until the attempt
//! budget is spent.

pub mod postgres;
pub mod queue;
pub mod service;
pub mod store;
pub mod types;

pub use postgres::PostgresBatchJobStore;
pub use queue::{CycleReport, JobOutcome, JobQueue, JobQueueHandle, QueueStats};
pub use service::{BatchJobService, CreateJobRequest, JobServiceError};
pub use store::{BatchJobStore, InMemoryBatchJobStore, JobStoreError};
pub use types::{
    BackoffStrategy, BatchJob, BatchJobStatus, JobLogEntry, JobProgress, JobStats, LogLevel,
    NewBatchJob, RetryPolicy,
};
