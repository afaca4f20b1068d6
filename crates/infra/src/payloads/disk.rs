//! On-disk staging of raw provider pages.
//!
//! Layout: `{root}/{YYYY-MM}/{reference}_b{batch:05}_{id}.json`. Each file is
//! written to a hidden temp sibling and renamed into place, so a reader never
//! observes a partial page.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use mailhaus_core::{BatchJobId, PayloadFileId};
use mailhaus_providers::ProviderCode;

use super::store::{PayloadError, PayloadFileStore};
use super::types::{CleanupReport, NewPayload, PayloadFile, PayloadStatus};

/// Body of a staged page.
#[derive(Debug, Serialize, Deserialize)]
struct PayloadDocument {
    reference: String,
    job_id: Option<BatchJobId>,
    provider: ProviderCode,
    batch_number: u32,
    saved_at: DateTime<Utc>,
    records: Vec<Value>,
}

/// Staging directory plus its status table.
#[derive(Clone)]
pub struct PayloadStore {
    root: PathBuf,
    files: Arc<dyn PayloadFileStore>,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>, files: Arc<dyn PayloadFileStore>) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &Arc<dyn PayloadFileStore> {
        &self.files
    }

    /// Write one page to disk and register it as PENDING.
    pub async fn save_payload(&self, payload: NewPayload) -> Result<PayloadFile, PayloadError> {
        let now = Utc::now();
        let id = PayloadFileId::new();
        let dir = self.root.join(month_dir_name(now));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PayloadError::io(&dir, e))?;

        let name = format!(
            "{}_b{:05}_{}.json",
            sanitize(&payload.reference),
            payload.batch_number,
            id
        );
        let path = dir.join(&name);
        let tmp = dir.join(format!(".{name}.tmp"));

        let record_count = payload.records.len() as u64;
        let doc = PayloadDocument {
            reference: payload.reference.clone(),
            job_id: payload.job_id,
            provider: payload.provider,
            batch_number: payload.batch_number,
            saved_at: now,
            records: payload.records,
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| PayloadError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        if let Err(e) = write_synced(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(PayloadError::io(&tmp, e));
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PayloadError::io(&path, e))?;

        let file = PayloadFile {
            id,
            file_path: path,
            provider: payload.provider,
            job_id: payload.job_id,
            reference: payload.reference,
            batch_number: payload.batch_number,
            record_count,
            status: PayloadStatus::Pending,
            error_details: None,
            created_at: now,
            processed_at: None,
        };
        self.files.insert(file.clone()).await?;

        debug!(
            file = %file.file_path.display(),
            batch = file.batch_number,
            records = record_count,
            "staged payload"
        );
        Ok(file)
    }

    /// Read the records of a staged page.
    ///
    /// Accepts the wrapped document written by [`save_payload`](Self::save_payload)
    /// and a bare JSON array of records.
    pub async fn read_payload(&self, file: &PayloadFile) -> Result<Vec<Value>, PayloadError> {
        let bytes = tokio::fs::read(&file.file_path)
            .await
            .map_err(|e| PayloadError::io(&file.file_path, e))?;
        parse_records(&file.file_path, &bytes)
    }

    /// PENDING files older than `threshold`.
    pub async fn find_stuck_files(
        &self,
        threshold: chrono::Duration,
    ) -> Result<Vec<PayloadFile>, PayloadError> {
        self.files.pending_before(Utc::now() - threshold).await
    }

    /// Delete PROCESSED pages (file and row) older than the retention window
    /// and remove month directories left empty.
    ///
    /// `months_to_keep` counts the current month, so `3` in October keeps
    /// August through October. Individual failures are logged and reported,
    /// not returned.
    pub async fn cleanup_old_files(&self, months_to_keep: u32) -> Result<CleanupReport, PayloadError> {
        self.cleanup_old_files_as_of(months_to_keep, Utc::now()).await
    }

    pub async fn cleanup_old_files_as_of(
        &self,
        months_to_keep: u32,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, PayloadError> {
        let cutoff = retention_cutoff(now, months_to_keep);
        let mut report = CleanupReport::default();

        for file in self.files.processed_before(cutoff).await? {
            match tokio::fs::remove_file(&file.file_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %file.file_path.display(), error = %e, "failed to delete payload file");
                    report
                        .errors
                        .push(format!("{}: {e}", file.file_path.display()));
                    continue;
                }
            }
            if let Err(e) = self.files.delete(file.id).await {
                warn!(file_id = %file.id, error = %e, "failed to delete payload row");
                report.errors.push(format!("{}: {e}", file.id));
                continue;
            }
            report.files_deleted += 1;
        }

        let cutoff_month = month_dir_name(cutoff);
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(PayloadError::io(&self.root, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PayloadError::io(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_month_dir_name(&name) || name >= cutoff_month {
                continue;
            }
            // remove_dir only succeeds on empty directories.
            match tokio::fs::remove_dir(entry.path()).await {
                Ok(()) => report.dirs_removed += 1,
                Err(e) => debug!(dir = %name, error = %e, "month directory kept"),
            }
        }

        info!(
            files_deleted = report.files_deleted,
            dirs_removed = report.dirs_removed,
            errors = report.errors.len(),
            "payload cleanup finished"
        );
        Ok(report)
    }
}

impl core::fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PayloadStore")
            .field("root", &self.root)
            .finish()
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut f = tokio::fs::File::create(path).await?;
    f.write_all(bytes).await?;
    f.sync_all().await
}

fn parse_records(path: &Path, bytes: &[u8]) -> Result<Vec<Value>, PayloadError> {
    let parse_err = |message: String| PayloadError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let value: Value = serde_json::from_slice(bytes).map_err(|e| parse_err(e.to_string()))?;
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(parse_err("missing `records` array".to_string())),
        },
        _ => Err(parse_err("expected a JSON array or object".to_string())),
    }
}

fn month_dir_name(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

fn is_month_dir_name(name: &str) -> bool {
    NaiveDate::parse_from_str(&format!("{name}-01"), "%Y-%m-%d").is_ok() && name.len() == 7
}

/// First instant of the oldest month kept.
fn retention_cutoff(now: DateTime<Utc>, months_to_keep: u32) -> DateTime<Utc> {
    let back = months_to_keep.max(1) as i32 - 1;
    let months = now.year() * 12 + now.month0() as i32 - back;
    let (year, month0) = (months.div_euclid(12), months.rem_euclid(12) as u32);
    Utc.with_ymd_and_hms(year, month0 + 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn sanitize(reference: &str) -> String {
    let cleaned: String = reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "payload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::store::InMemoryPayloadFileStore;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> PayloadStore {
        PayloadStore::new(dir.path(), Arc::new(InMemoryPayloadFileStore::new()))
    }

    fn page(batch: u32, records: Vec<Value>) -> NewPayload {
        NewPayload {
            provider: ProviderCode::PropertyRadar,
            job_id: None,
            reference: "list 42/ca".into(),
            batch_number: batch,
            records,
        }
    }

    #[tokio::test]
    async fn save_writes_month_dir_and_pending_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let file = store
            .save_payload(page(1, vec![json!({"RadarID": "P1"}), json!({"RadarID": "P2"})]))
            .await
            .unwrap();

        assert_eq!(file.status, PayloadStatus::Pending);
        assert_eq!(file.record_count, 2);
        assert!(file.file_path.exists());
        assert_eq!(
            file.file_path.parent().unwrap().file_name().unwrap().to_string_lossy(),
            month_dir_name(Utc::now())
        );
        let name = file.file_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("list_42_ca_b00001_"), "{name}");

        let leftovers: Vec<_> = std::fs::read_dir(file.file_path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let records = store.read_payload(&file).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["RadarID"], "P2");

        let pending = store.files().list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn reads_bare_arrays_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut file = store.save_payload(page(1, vec![])).await.unwrap();

        std::fs::write(&file.file_path, br#"[{"RadarID": "P9"}]"#).unwrap();
        let records = store.read_payload(&file).await.unwrap();
        assert_eq!(records[0]["RadarID"], "P9");

        std::fs::write(&file.file_path, b"{not json").unwrap();
        assert!(matches!(
            store.read_payload(&file).await,
            Err(PayloadError::Parse { .. })
        ));

        file.file_path = dir.path().join("missing.json");
        assert!(matches!(
            store.read_payload(&file).await,
            Err(PayloadError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn finds_only_old_pending_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let fresh = store.save_payload(page(1, vec![])).await.unwrap();

        let mut old = fresh.clone();
        old.id = PayloadFileId::new();
        old.created_at = Utc::now() - chrono::Duration::hours(3);
        store.files().insert(old.clone()).await.unwrap();

        let stuck = store
            .find_stuck_files(chrono::Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, old.id);
    }

    #[tokio::test]
    async fn cleanup_removes_old_processed_files_and_empty_months() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();

        let stage = |month: &str, status: PayloadStatus, created_at: DateTime<Utc>| {
            let month_dir = dir.path().join(month);
            std::fs::create_dir_all(&month_dir).unwrap();
            let id = PayloadFileId::new();
            let path = month_dir.join(format!("{id}.json"));
            std::fs::write(&path, b"[]").unwrap();
            PayloadFile {
                id,
                file_path: path,
                provider: ProviderCode::PropertyRadar,
                job_id: None,
                reference: "r".into(),
                batch_number: 1,
                record_count: 0,
                status,
                error_details: None,
                created_at,
                processed_at: None,
            }
        };

        let june = Utc.with_ymd_and_hms(2026, 6, 3, 0, 0, 0).unwrap();
        let july = Utc.with_ymd_and_hms(2026, 7, 3, 0, 0, 0).unwrap();
        let sept = Utc.with_ymd_and_hms(2026, 9, 3, 0, 0, 0).unwrap();

        let old_done = stage("2026-06", PayloadStatus::Processed, june);
        let old_failed = stage("2026-07", PayloadStatus::Failed, july);
        let recent_done = stage("2026-09", PayloadStatus::Processed, sept);
        for f in [&old_done, &old_failed, &recent_done] {
            store.files().insert(f.clone()).await.unwrap();
        }

        let report = store.cleanup_old_files_as_of(3, now).await.unwrap();

        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.dirs_removed, 1);
        assert!(report.errors.is_empty());
        assert!(!old_done.file_path.exists());
        assert!(!dir.path().join("2026-06").exists());
        assert!(old_failed.file_path.exists());
        assert!(recent_done.file_path.exists());
        assert!(store.files().get(old_done.id).await.unwrap().is_none());
        assert!(store.files().get(old_failed.id).await.unwrap().is_some());
    }

    #[test]
    fn retention_cutoff_counts_current_month() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        assert_eq!(
            retention_cutoff(now, 3),
            Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            retention_cutoff(now, 1),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
        );
    }
}
