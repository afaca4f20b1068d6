use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use mailhaus_infra::config::WorkerConfig;
use mailhaus_infra::dnm::DnmRegistry;
use mailhaus_infra::jobs::{BatchJob, BatchJobStatus, BatchJobStore, CreateJobRequest};
use mailhaus_infra::payloads::{PayloadFileStore, PayloadStatus};
use mailhaus_infra::properties::PropertyRepository;
use mailhaus_properties::{NewDnmEntry, RadarId};
use mailhaus_providers::ProviderCode;
use mailhaus_worker::app::{Stores, build_worker};

/// In-process stand-in for the PropertyRadar API.
struct FakeRadar {
    base_url: String,
    calls: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeRadar {
    async fn spawn(records: Vec<Value>) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/v1/properties", post(properties))
            .with_state((Arc::new(records), calls.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/v1"),
            calls,
            handle,
        }
    }
}

impl Drop for FakeRadar {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn properties(
    State((records, calls)): State<(Arc<Vec<Value>>, Arc<AtomicUsize>)>,
    Query(q): Query<HashMap<String, String>>,
    Json(_body): Json<Value>,
) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    let start: usize = q.get("Start").and_then(|s| s.parse().ok()).unwrap_or(0);
    let limit: usize = q.get("Limit").and_then(|s| s.parse().ok()).unwrap_or(500);
    let page: Vec<Value> = records.iter().skip(start).take(limit).cloned().collect();
    Json(json!({"results": page, "totalResultCount": records.len()}))
}

fn config(base_url: &str, payload_dir: &std::path::Path, token: Option<&str>) -> WorkerConfig {
    let mut env = HashMap::from([
        ("DATABASE_URL".to_string(), "postgres://unused/unused".to_string()),
        ("PROPERTY_RADAR_BASE_URL".to_string(), base_url.to_string()),
        ("PAYLOAD_DIR".to_string(), payload_dir.display().to_string()),
        ("QUEUE_POLL_INTERVAL_SECS".to_string(), "0".to_string()),
        ("QUEUE_PAGE_SIZE".to_string(), "2".to_string()),
    ]);
    if let Some(t) = token {
        env.insert("PROPERTY_RADAR_TOKEN".to_string(), t.to_string());
    }
    WorkerConfig::from_lookup(|k| env.get(k).cloned()).unwrap()
}

fn request() -> CreateJobRequest {
    CreateJobRequest {
        provider: ProviderCode::PropertyRadar,
        criteria: json!({"Criteria": [{"name": "County", "value": ["06019"]}]}),
        campaign_id: None,
        created_by: None,
    }
}

async fn wait_for_terminal(stores: &Stores, job: &BatchJob) -> BatchJob {
    for _ in 0..200 {
        let current = stores.jobs.get(job.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job did not reach a terminal state within timeout");
}

#[tokio::test]
async fn job_is_fetched_staged_and_ingested() {
    let radar = FakeRadar::spawn(vec![
        json!({"RadarID": "R1", "AVM": 250000, "City": "Fresno", "Owner": "JANE DOE"}),
        json!({"RadarID": "R2", "AVM": "Unknown", "City": "Clovis"}),
        json!({"Address": "record without an id"}),
        json!({"RadarID": "R4", "Beds": "3"}),
        json!({"RadarID": "R5", "FirstAmount": "$120,000"}),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::in_memory();
    stores
        .dnm
        .add(NewDnmEntry {
            radar_id: Some(RadarId::parse("R4").unwrap()),
            loan_id: None,
            reason: "returned mail".into(),
            source: "operator".into(),
            blocked_by: None,
        })
        .await
        .unwrap();

    let worker = build_worker(&config(&radar.base_url, dir.path(), Some("tok")), stores.clone()).unwrap();
    let jobs = worker.jobs.clone();
    let job = jobs.create_job(request()).await.unwrap();
    let running = worker.start(CancellationToken::new());

    let done = wait_for_terminal(&stores, &job).await;
    running.shutdown().await;

    assert_eq!(done.status, BatchJobStatus::Completed);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.progress.total_records(), 5);
    assert_eq!(done.progress.processed_records(), 5);
    assert_eq!(done.progress.success_count(), 4);
    assert_eq!(done.progress.error_count(), 1);
    assert_eq!(radar.calls.load(Ordering::SeqCst), 3);

    assert_eq!(stores.properties.count().await.unwrap(), 4);
    let r2 = stores
        .properties
        .get(&RadarId::parse("R2").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r2.property.avm, None);
    assert_eq!(r2.property.address.city.as_deref(), Some("Clovis"));

    let far_future = Utc::now() + chrono::Duration::days(366 * 10);
    assert!(stores.files.pending_before(far_future).await.unwrap().is_empty());
    let staged = stores.files.processed_before(far_future).await.unwrap();
    assert_eq!(staged.len(), 3);
    for file in &staged {
        assert_eq!(file.status, PayloadStatus::Processed);
        assert_eq!(file.job_id, Some(job.id));
        assert!(file.file_path.starts_with(dir.path()));
        assert!(file.file_path.exists());
    }

    let logs = jobs.logs(job.id, 100).await.unwrap();
    let last = logs.last().unwrap();
    assert_eq!(
        last.message,
        "completed: 5 records, 4 stored, 1 errors, 1 suppressed by DNM"
    );
    assert_eq!(jobs.stats().await.unwrap().completed, 1);
}

#[tokio::test]
async fn missing_credentials_fail_the_job_without_retry() {
    let radar = FakeRadar::spawn(vec![json!({"RadarID": "R1"})]).await;
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::in_memory();

    let worker = build_worker(&config(&radar.base_url, dir.path(), None), stores.clone()).unwrap();
    let jobs = worker.jobs.clone();
    let job = jobs.create_job(request()).await.unwrap();
    let running = worker.start(CancellationToken::new());

    let done = wait_for_terminal(&stores, &job).await;
    running.shutdown().await;

    assert_eq!(done.status, BatchJobStatus::Failed);
    assert_eq!(done.attempts, 1);
    assert!(done.error_details.unwrap().contains("setup"));
    assert_eq!(radar.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stores.properties.count().await.unwrap(), 0);
}

#[tokio::test]
async fn operator_retry_runs_a_failed_job_again() {
    let radar = FakeRadar::spawn(vec![json!({"RadarID": "R1"})]).await;
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::in_memory();

    // First pass without a token fails the job.
    let worker = build_worker(&config(&radar.base_url, dir.path(), None), stores.clone()).unwrap();
    let job = worker.jobs.create_job(request()).await.unwrap();
    let running = worker.start(CancellationToken::new());
    assert_eq!(wait_for_terminal(&stores, &job).await.status, BatchJobStatus::Failed);
    running.shutdown().await;

    // Restart with credentials and re-queue.
    let worker = build_worker(&config(&radar.base_url, dir.path(), Some("tok")), stores.clone()).unwrap();
    let retried = worker.jobs.retry_failed_job(job.id).await.unwrap();
    assert_eq!(retried.status, BatchJobStatus::Pending);
    assert_eq!(retried.attempts, 0);

    let running = worker.start(CancellationToken::new());
    let done = wait_for_terminal(&stores, &job).await;
    running.shutdown().await;

    assert_eq!(done.status, BatchJobStatus::Completed);
    assert_eq!(stores.properties.count().await.unwrap(), 1);
}
