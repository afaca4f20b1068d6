//! Builds the worker from configuration and a set of stores.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mailhaus_infra::config::WorkerConfig;
use mailhaus_infra::dnm::{DnmRegistry, InMemoryDnmRegistry, PostgresDnmRegistry};
use mailhaus_infra::ingest::PropertyBatchService;
use mailhaus_infra::jobs::{
    BatchJobService, BatchJobStore, InMemoryBatchJobStore, JobQueue, JobQueueHandle,
    PostgresBatchJobStore, QueueStats,
};
use mailhaus_infra::payloads::{
    InMemoryPayloadFileStore, PayloadFileStore, PayloadStore, PostgresPayloadFileStore,
};
use mailhaus_infra::properties::{
    InMemoryPropertyRepository, PostgresPropertyRepository, PropertyRepository,
};
use mailhaus_providers::propertyradar::PropertyRadarProvider;
use mailhaus_providers::{ProviderError, ProviderRegistry};

use crate::housekeeping::Housekeeping;

/// Persistence backends used by the worker.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn BatchJobStore>,
    pub files: Arc<dyn PayloadFileStore>,
    pub properties: Arc<dyn PropertyRepository>,
    pub dnm: Arc<dyn DnmRegistry>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresBatchJobStore::new(pool.clone())),
            files: Arc::new(PostgresPayloadFileStore::new(pool.clone())),
            properties: Arc::new(PostgresPropertyRepository::new(pool.clone())),
            dnm: Arc::new(PostgresDnmRegistry::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryBatchJobStore::new()),
            files: Arc::new(InMemoryPayloadFileStore::new()),
            properties: Arc::new(InMemoryPropertyRepository::new()),
            dnm: Arc::new(InMemoryDnmRegistry::new()),
        }
    }
}

/// A fully wired worker, not yet running.
pub struct Worker {
    pub jobs: BatchJobService,
    pub ingest: PropertyBatchService,
    queue: JobQueue,
    housekeeping: Housekeeping,
}

/// Handles of a started worker.
#[derive(Debug)]
pub struct RunningWorker {
    queue: JobQueueHandle,
    housekeeping: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl RunningWorker {
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Cancel both loops and wait for them. The job in flight finishes its
    /// current page and is released back to PENDING.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.queue.shutdown().await;
        if let Err(e) = self.housekeeping.await {
            error!(error = %e, "housekeeping task ended abnormally");
        }
    }
}

/// Register providers and wire services over `stores`.
pub fn build_worker(config: &WorkerConfig, stores: Stores) -> Result<Worker, ProviderError> {
    let radar = PropertyRadarProvider::new(config.property_radar.clone())?;
    let providers = ProviderRegistry::builder().register(Arc::new(radar)).build();
    for info in providers.list() {
        if !info.is_configured {
            warn!(provider = %info.code, "provider has no credentials; its jobs will fail");
        }
    }

    let payloads = PayloadStore::new(config.payload_dir.clone(), stores.files);
    let ingest = PropertyBatchService::new(payloads.clone(), stores.properties, providers.clone());
    let jobs = BatchJobService::new(stores.jobs.clone(), providers.clone());
    let queue = JobQueue::new(
        stores.jobs,
        ingest.clone(),
        providers,
        stores.dnm,
        config.queue.clone(),
    );
    let housekeeping = Housekeeping::new(payloads, config.housekeeping.clone());

    Ok(Worker {
        jobs,
        ingest,
        queue,
        housekeeping,
    })
}

impl Worker {
    pub fn start(self, shutdown: CancellationToken) -> RunningWorker {
        let queue = self.queue.spawn(shutdown.child_token());
        let housekeeping = self.housekeeping.spawn(shutdown.child_token());
        info!("worker started");
        RunningWorker {
            queue,
            housekeeping,
            shutdown,
        }
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("housekeeping", &self.housekeeping)
            .finish()
    }
}
