//! Periodic payload directory upkeep: report stuck files, prune old pages.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mailhaus_infra::config::HousekeepingConfig;
use mailhaus_infra::payloads::{CleanupReport, PayloadError, PayloadStore};

#[derive(Debug, Clone, Default)]
pub struct HousekeepingReport {
    pub stuck: usize,
    pub cleanup: CleanupReport,
}

#[derive(Debug, Clone)]
pub struct Housekeeping {
    payloads: PayloadStore,
    config: HousekeepingConfig,
}

impl Housekeeping {
    pub fn new(payloads: PayloadStore, config: HousekeepingConfig) -> Self {
        Self { payloads, config }
    }

    /// Log every stuck PENDING file, then run retention cleanup.
    ///
    /// Stuck files are only reported; the queue drains PENDING files on its
    /// own and an operator decides about anything left behind.
    pub async fn run_once(&self) -> Result<HousekeepingReport, PayloadError> {
        let threshold = chrono::Duration::from_std(self.config.stuck_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let now = Utc::now();

        let stuck = self.payloads.find_stuck_files(threshold).await?;
        for file in &stuck {
            warn!(
                file = %file.file_path.display(),
                file_id = %file.id,
                batch = file.batch_number,
                age_minutes = file.age(now).num_minutes(),
                "payload file stuck in PENDING"
            );
        }

        let cleanup = self
            .payloads
            .cleanup_old_files(self.config.retention_months)
            .await?;

        Ok(HousekeepingReport {
            stuck: stuck.len(),
            cleanup,
        })
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                retention_months = self.config.retention_months,
                "housekeeping started"
            );
            loop {
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "housekeeping run failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
            info!("housekeeping stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::DateTime;
    use mailhaus_core::PayloadFileId;
    use mailhaus_infra::payloads::{
        InMemoryPayloadFileStore, PayloadFile, PayloadFileStore, PayloadStatus,
    };
    use mailhaus_providers::ProviderCode;

    use super::*;

    fn row(path: PathBuf, status: PayloadStatus, created_at: DateTime<Utc>) -> PayloadFile {
        PayloadFile {
            id: PayloadFileId::new(),
            file_path: path,
            provider: ProviderCode::PropertyRadar,
            job_id: None,
            reference: "hk".into(),
            batch_number: 1,
            record_count: 0,
            status,
            error_details: None,
            created_at,
            processed_at: None,
        }
    }

    fn config() -> HousekeepingConfig {
        HousekeepingConfig {
            interval: Duration::from_millis(10),
            stuck_after: Duration::from_secs(60 * 60),
            retention_months: 3,
        }
    }

    #[tokio::test]
    async fn reports_stuck_and_prunes_old_pages() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(InMemoryPayloadFileStore::new());
        let payloads = PayloadStore::new(dir.path(), files.clone());

        let old_dir = dir.path().join("2020-01");
        std::fs::create_dir_all(&old_dir).unwrap();
        let old_path = old_dir.join("old_b00001.json");
        std::fs::write(&old_path, b"[]").unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(365 * 5);
        let old = row(old_path.clone(), PayloadStatus::Processed, long_ago);
        files.insert(old.clone()).await.unwrap();

        let stuck = row(
            dir.path().join("stuck.json"),
            PayloadStatus::Pending,
            Utc::now() - chrono::Duration::hours(3),
        );
        files.insert(stuck.clone()).await.unwrap();
        let fresh = row(dir.path().join("fresh.json"), PayloadStatus::Pending, Utc::now());
        files.insert(fresh).await.unwrap();

        let report = Housekeeping::new(payloads, config()).run_once().await.unwrap();

        assert_eq!(report.stuck, 1);
        assert_eq!(report.cleanup.files_deleted, 1);
        assert_eq!(report.cleanup.dirs_removed, 1);
        assert!(!old_path.exists());
        assert!(files.get(old.id).await.unwrap().is_none());
        // Stuck files are reported, never touched.
        assert_eq!(
            files.get(stuck.id).await.unwrap().unwrap().status,
            PayloadStatus::Pending
        );
    }

    #[tokio::test]
    async fn spawned_task_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = PayloadStore::new(dir.path(), Arc::new(InMemoryPayloadFileStore::new()));
        let token = CancellationToken::new();

        let handle = Housekeeping::new(payloads, config()).spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
