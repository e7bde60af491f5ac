use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use deltaguard_core::JobEventHub;
use deltaguard_core::progress_log::ProgressLog;
use deltaguard_core::runner::ScannerMode;
use deltaguard_core::store::MemoryJobStore;
use deltaguard_core::tailer::TailerConfig;
use deltaguard_core::types::{Job, JobId, JobSource, JobStatus, NewJob};
use deltaguard_server::AppState;
use deltaguard_server::infra::config::{compose_config, sources::{EnvConfig, FileConfig}};
use deltaguard_server::routes::create_app;
use futures::StreamExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _dir: TempDir,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = compose_config(FileConfig::default(), EnvConfig::default()).unwrap();
        config.progress_dir = dir.path().join("progress");
        config.runner.mode = ScannerMode::Mock;
        config.runner.uploads_dir = dir.path().join("uploads");
        config.tailer = TailerConfig {
            interval: Duration::from_millis(20),
            ..TailerConfig::default()
        };

        let log = Arc::new(ProgressLog::new(&config.progress_dir));
        let hub = Arc::new(JobEventHub::new(
            Arc::new(MemoryJobStore::new()),
            log,
            config.hub_config(),
        ));
        Self {
            _dir: dir,
            state: AppState::new(hub, Arc::new(config)),
        }
    }

    fn hub(&self) -> &JobEventHub {
        &self.state.hub
    }

    fn router(&self) -> Router {
        create_app(self.state.clone())
    }

    async fn queued_job(&self) -> Job {
        self.hub()
            .create_job(NewJob::new(JobSource::path("/srv/uploads/router.bin")))
            .await
            .unwrap()
    }
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Reads an event stream until `needle` shows up.
async fn read_until(body: Body, needle: &str) -> String {
    let mut stream = body.into_data_stream();
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !text.contains(needle) {
            let chunk = stream.next().await.expect("stream ended").unwrap();
            text.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    })
    .await
    .unwrap_or_else(|_| panic!("`{needle}` not seen in {text:?}"));
    text
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{}", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["ok"], false);
}

#[tokio::test]
async fn malformed_job_id_is_rejected() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(request("GET", "/jobs/not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_job_starts_scan() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/jobs")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"bucket": "firmware", "object_key": "uploads/router.bin"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let created = json_body(response).await;
    assert_eq!(created["status"], "queued");
    assert_eq!(created["progress_pct"], 0);
    assert_eq!(created["mode"], "light");
    let id: JobId = serde_json::from_value(created["id"].clone()).unwrap();

    let mut status = JobStatus::Queued;
    for _ in 0..100 {
        status = app.hub().get(id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, JobStatus::Done);

    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    assert_eq!(job["status"], "done");
    assert_eq!(job["summary"]["total_findings"], 1);

    let results = app.state.scans.drain(Duration::from_secs(5)).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, id);
    assert!(results[0].1.is_ok());
}

#[tokio::test]
async fn cancel_reports_whether_anything_was_running() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(request("POST", &format!("/scans/{}/cancel", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let job = app.queued_job().await;
    let response = app
        .router()
        .oneshot(request("POST", &format!("/scans/{}/cancel", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"ok": true, "cancelled": false}));
    assert_eq!(app.hub().get(job.id).await.unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let app = TestApp::new();
    let job = app.queued_job().await;

    for _ in 0..2 {
        let response = app
            .router()
            .oneshot(request("DELETE", &format!("/jobs/{}", job.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"ok": true}));
    }
    assert!(app.hub().get(job.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn job_stream_opens_with_ping_then_snapshot() {
    let app = TestApp::new();
    let job = app.queued_job().await;

    let response = app
        .router()
        .oneshot(request("GET", "/jobs/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );

    let text = read_until(response.into_body(), &job.id.to_string()).await;
    assert!(text.starts_with(": ping\n\n"), "{text:?}");
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    let snapshot: Value = serde_json::from_str(data).unwrap();
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["items"][0]["id"], json!(job.id));
}

#[tokio::test]
async fn job_stream_forwards_changes() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(request("GET", "/jobs/events"))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    // Ping and the empty snapshot.
    let mut text = String::new();
    while !text.contains("snapshot") {
        let chunk = body.next().await.unwrap().unwrap();
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    let job = app.queued_job().await;
    let text = read_until(Body::from_stream(body), "\"changed\"").await;
    assert!(text.contains(&job.id.to_string()), "{text:?}");
}

#[tokio::test]
async fn progress_stream_replays_backlog() {
    let app = TestApp::new();
    let job = app.queued_job().await;
    let log = app.hub().log();
    log.append(job.id, "scan.extract", None, Some(10.0))
        .await
        .unwrap();
    log.append(job.id, "scan.deps", None, Some(60.0))
        .await
        .unwrap();

    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{}/events", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let text = read_until(response.into_body(), "scan.deps").await;
    assert!(text.starts_with(": ping\n\n"), "{text:?}");
    let stages: Vec<String> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str::<Value>(data).unwrap()["stage"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(stages, vec!["scan.extract", "scan.deps"]);
}

#[tokio::test]
async fn progress_list_returns_records_oldest_first() {
    let app = TestApp::new();
    let job = app.queued_job().await;
    let log = app.hub().log();
    for (stage, pct) in [("scan.extract", 10.0), ("scan.deps", 60.0)] {
        log.append(job.id, stage, None, Some(pct)).await.unwrap();
    }

    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{}/events/list", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let records = json_body(response).await;
    let stages: Vec<&str> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|record| record["stage"].as_str().unwrap())
        .collect();
    assert_eq!(stages, vec!["scan.extract", "scan.deps"]);
    assert_eq!(records[1]["pct"], 60.0);

    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{}/events/list", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn progress_list_is_empty_without_a_log() {
    let app = TestApp::new();
    let job = app.queued_job().await;
    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{}/events/list", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!([]));
}

#[tokio::test]
async fn progress_stream_for_unknown_job_is_404() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(request("GET", &format!("/jobs/{}/events", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn shutdown_ends_open_streams() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(request("GET", "/jobs/events"))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    body.next().await.unwrap().unwrap();

    app.state.shutdown.cancel();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            chunk.unwrap();
        }
    })
    .await;
    assert!(drained.is_ok());
}
