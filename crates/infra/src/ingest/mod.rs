//! Staged payload files → normalized property rows.
//!
//! Each file is ingested as a unit: its transformable records are upserted in
//! one batch and the file is then marked PROCESSED. Any file-level failure
//! (unreadable file, unknown provider, storage error) marks that file FAILED
//! and processing moves on to the next one. A record the provider cannot
//! transform is counted as a record error and does not fail the file.
//!
//! Once the rows are committed the file's records count as stored even if
//! the PROCESSED status write fails afterwards. Such a file stays PENDING and
//! the next drain ingests it again, which the upsert makes harmless.

use std::sync::Arc;

use tracing::{error, info, warn};

use mailhaus_core::PayloadFileId;
use mailhaus_properties::RadarId;
use mailhaus_providers::{ProviderError, ProviderRegistry};

use crate::payloads::{PayloadError, PayloadFile, PayloadStatus, PayloadStore};
use crate::properties::{PropertyRepository, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Record counts of one ingested file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub records: u64,
    pub success: u64,
    pub errors: u64,
    /// Keys of the rows written, in file order.
    pub radar_ids: Vec<RadarId>,
    /// False when the rows were stored but the PROCESSED mark was not.
    pub status_recorded: bool,
}

/// Totals of one `process_pending_files` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRunSummary {
    pub processed: usize,
    pub failed: usize,
    pub records: u64,
    pub success: u64,
    pub errors: u64,
}

#[derive(Clone)]
pub struct PropertyBatchService {
    payloads: PayloadStore,
    properties: Arc<dyn PropertyRepository>,
    providers: ProviderRegistry,
}

impl PropertyBatchService {
    pub fn new(
        payloads: PayloadStore,
        properties: Arc<dyn PropertyRepository>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            payloads,
            properties,
            providers,
        }
    }

    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    /// Ingest up to `max_files` PENDING files, oldest first.
    ///
    /// Only listing the files can fail the run; per-file failures are
    /// recorded on the file and counted in the summary.
    pub async fn process_pending_files(
        &self,
        max_files: usize,
    ) -> Result<BatchRunSummary, IngestError> {
        let files = self.payloads.files().list_pending(max_files).await?;
        let mut summary = BatchRunSummary::default();

        for file in files {
            match self.process_file(&file).await {
                Ok(outcome) => {
                    summary.processed += 1;
                    summary.records += outcome.records;
                    summary.success += outcome.success;
                    summary.errors += outcome.errors;
                }
                Err(_) => summary.failed += 1,
            }
        }

        if summary.processed + summary.failed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                records = summary.records,
                "pending payload files ingested"
            );
        }
        Ok(summary)
    }

    /// Ingest one file and record the result on its status row.
    pub async fn process_file(&self, file: &PayloadFile) -> Result<FileOutcome, IngestError> {
        match self.ingest(file).await {
            Ok(mut outcome) => {
                match self.payloads.files().mark_processed(file.id).await {
                    Ok(()) => outcome.status_recorded = true,
                    Err(e) => warn!(
                        file = %file.file_path.display(),
                        file_id = %file.id,
                        error = %e,
                        "rows stored but payload file not marked processed; it will be re-ingested"
                    ),
                }
                info!(
                    file = %file.file_path.display(),
                    batch = file.batch_number,
                    records = outcome.records,
                    success = outcome.success,
                    errors = outcome.errors,
                    "payload file processed"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(
                    file = %file.file_path.display(),
                    batch = file.batch_number,
                    error = %err,
                    "payload file failed"
                );
                if let Err(mark_err) = self.payloads.files().mark_failed(file.id, &err.to_string()).await {
                    warn!(file_id = %file.id, error = %mark_err, "could not record payload failure");
                }
                Err(err)
            }
        }
    }

    /// Re-ingest a FAILED or stuck file. A PROCESSED file is left alone and
    /// `Ok(None)` is returned.
    pub async fn retry_file(&self, id: PayloadFileId) -> Result<Option<FileOutcome>, IngestError> {
        let file = self
            .payloads
            .files()
            .get(id)
            .await?
            .ok_or(PayloadError::NotFound(id))?;

        if file.status == PayloadStatus::Processed {
            info!(file_id = %id, "payload file already processed; skipping");
            return Ok(None);
        }
        self.process_file(&file).await.map(Some)
    }

    async fn ingest(&self, file: &PayloadFile) -> Result<FileOutcome, IngestError> {
        let records = self.payloads.read_payload(file).await?;
        let provider = self.providers.get(file.provider)?;

        let mut outcome = FileOutcome {
            records: records.len() as u64,
            ..Default::default()
        };
        let mut bundles = Vec::with_capacity(records.len());

        for (index, raw) in records.iter().enumerate() {
            match provider.transform(raw) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => {
                    outcome.errors += 1;
                    warn!(
                        file = %file.file_path.display(),
                        record = index,
                        error = %e,
                        "skipping untransformable record"
                    );
                }
            }
        }

        self.properties.upsert_batch(&bundles).await?;

        outcome.success = bundles.len() as u64;
        outcome.radar_ids = bundles.into_iter().map(|b| b.property.radar_id).collect();
        Ok(outcome)
    }
}

impl core::fmt::Debug for PropertyBatchService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PropertyBatchService")
            .field("payloads", &self.payloads)
            .field("providers", &self.providers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::store::tests::UnmarkableFileStore;
    use crate::payloads::{InMemoryPayloadFileStore, NewPayload, PayloadFileStore};
    use crate::properties::InMemoryPropertyRepository;
    use mailhaus_providers::ProviderCode;
    use mailhaus_providers::propertyradar::{PropertyRadarConfig, PropertyRadarProvider};
    use serde_json::{Value, json};

    struct Harness {
        _dir: tempfile::TempDir,
        service: PropertyBatchService,
        repo: Arc<InMemoryPropertyRepository>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let payloads = PayloadStore::new(dir.path(), Arc::new(InMemoryPayloadFileStore::new()));
        let repo = Arc::new(InMemoryPropertyRepository::new());
        let provider = PropertyRadarProvider::new(PropertyRadarConfig::default()).unwrap();
        let providers = ProviderRegistry::builder().register(Arc::new(provider)).build();
        let service = PropertyBatchService::new(payloads, repo.clone(), providers);
        Harness {
            _dir: dir,
            service,
            repo,
        }
    }

    async fn stage(h: &Harness, batch: u32, records: Vec<Value>) -> PayloadFile {
        h.service
            .payloads()
            .save_payload(NewPayload {
                provider: ProviderCode::PropertyRadar,
                job_id: None,
                reference: "test".into(),
                batch_number: batch,
                records,
            })
            .await
            .unwrap()
    }

    fn radar(id: &str) -> RadarId {
        RadarId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn unknown_avm_does_not_drop_the_record() {
        let h = harness();
        stage(
            &h,
            1,
            vec![
                json!({"RadarID": "P1", "AVM": 350000, "City": "Fresno"}),
                json!({"RadarID": "P2", "AVM": "Unknown", "City": "Clovis", "Beds": "3"}),
                json!({"RadarID": "P3", "AVM": "$1,500"}),
            ],
        )
        .await;

        let summary = h.service.process_pending_files(10).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.success, 3);
        assert_eq!(summary.errors, 0);

        let p2 = h.repo.get(&radar("P2")).await.unwrap().unwrap();
        assert_eq!(p2.property.avm, None);
        assert_eq!(p2.property.address.city.as_deref(), Some("Clovis"));
        assert_eq!(p2.property.beds, Some(3));

        let p3 = h.repo.get(&radar("P3")).await.unwrap().unwrap();
        assert_eq!(p3.property.avm, Some(1500.0));
    }

    #[tokio::test]
    async fn bad_file_fails_alone() {
        let h = harness();
        let broken = stage(&h, 1, vec![]).await;
        std::fs::write(&broken.file_path, b"{ truncated").unwrap();
        let good = stage(&h, 2, vec![json!({"RadarID": "P1"})]).await;

        let summary = h.service.process_pending_files(10).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);

        let files = h.service.payloads().files();
        let broken = files.get(broken.id).await.unwrap().unwrap();
        assert_eq!(broken.status, PayloadStatus::Failed);
        assert!(broken.error_details.unwrap().contains("unreadable payload"));
        assert_eq!(
            files.get(good.id).await.unwrap().unwrap().status,
            PayloadStatus::Processed
        );
        assert!(h.repo.get(&radar("P1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn records_without_radar_id_are_counted_not_fatal() {
        let h = harness();
        let file = stage(
            &h,
            1,
            vec![json!({"RadarID": "P1"}), json!({"Address": "no id"}), json!("junk")],
        )
        .await;

        let outcome = h.service.process_file(&file).await.unwrap();
        assert!(outcome.status_recorded);
        assert_eq!(outcome.records, 3);
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.radar_ids, vec![radar("P1")]);
    }

    #[tokio::test]
    async fn rerunning_is_idempotent() {
        let h = harness();
        stage(&h, 1, vec![json!({"RadarID": "P1"}), json!({"RadarID": "P2"})]).await;

        h.service.process_pending_files(10).await.unwrap();
        let again = h.service.process_pending_files(10).await.unwrap();

        assert_eq!(again, BatchRunSummary::default());
        assert_eq!(h.repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stored_rows_count_even_when_status_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(UnmarkableFileStore::default());
        let payloads = PayloadStore::new(dir.path(), files.clone());
        let repo = Arc::new(InMemoryPropertyRepository::new());
        let provider = PropertyRadarProvider::new(PropertyRadarConfig::default()).unwrap();
        let providers = ProviderRegistry::builder().register(Arc::new(provider)).build();
        let service = PropertyBatchService::new(payloads, repo.clone(), providers);

        let file = service
            .payloads()
            .save_payload(NewPayload {
                provider: ProviderCode::PropertyRadar,
                job_id: None,
                reference: "test".into(),
                batch_number: 1,
                records: vec![json!({"RadarID": "P1"}), json!({"RadarID": "P2"})],
            })
            .await
            .unwrap();

        let outcome = service.process_file(&file).await.unwrap();
        assert_eq!(outcome.success, 2);
        assert_eq!(outcome.errors, 0);
        assert!(!outcome.status_recorded);
        assert_eq!(repo.count().await.unwrap(), 2);

        // Left PENDING, so the next drain picks it up again without duplicating rows.
        assert_eq!(
            files.get(file.id).await.unwrap().unwrap().status,
            PayloadStatus::Pending
        );
        let again = service.process_pending_files(10).await.unwrap();
        assert_eq!(again.processed, 1);
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn retry_recovers_failed_file_and_skips_processed() {
        let h = harness();
        let file = stage(&h, 1, vec![json!({"RadarID": "P1"})]).await;
        let original = std::fs::read(&file.file_path).unwrap();
        std::fs::write(&file.file_path, b"nope").unwrap();

        assert!(h.service.process_file(&file).await.is_err());
        assert_eq!(
            h.service.payloads().files().get(file.id).await.unwrap().unwrap().status,
            PayloadStatus::Failed
        );

        std::fs::write(&file.file_path, original).unwrap();
        let outcome = h.service.retry_file(file.id).await.unwrap().unwrap();
        assert_eq!(outcome.success, 1);

        assert!(h.service.retry_file(file.id).await.unwrap().is_none());
        assert_eq!(h.repo.count().await.unwrap(), 1);
    }
}
