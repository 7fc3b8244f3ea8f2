use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use run_relay_core::{ExecutorError, NoticeSender, RunExecutor, RunRequest};
use run_relay_executor::AutoApproveHandler;
use run_relay_session::{AdmissionController, AdmissionPolicy, RunOrchestrator, SessionRegistry};
use run_relay_transport::{AppState, router};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_test::assert_ok;
use tower::ServiceExt;

/// Echoes the instruction as one item, then waits for the gate. An
/// instruction starting with `fail` resolves with an error instead.
struct GatedExecutor {
    gate: Arc<Notify>,
}

#[async_trait]
impl RunExecutor for GatedExecutor {
    async fn execute(
        &self,
        request: RunRequest,
        notices: NoticeSender,
    ) -> Result<(), ExecutorError> {
        notices.item(json!({ "id": "echo", "text": request.instruction() }));
        self.gate.notified().await;
        if request.instruction().starts_with("fail") {
            return Err(ExecutorError::Failed("disk full".into()));
        }
        Ok(())
    }
}

fn app(policy: AdmissionPolicy) -> (Router, Arc<RunOrchestrator>, Arc<Notify>) {
    let gate = Arc::new(Notify::new());
    let executor = Arc::new(GatedExecutor {
        gate: Arc::clone(&gate),
    });
    let orchestrator = Arc::new(RunOrchestrator::new(
        SessionRegistry::new(),
        executor,
        Arc::new(AutoApproveHandler),
        AdmissionController::new(policy),
    ));
    let router = router(AppState::new(Arc::clone(&orchestrator)));
    (router, orchestrator, gate)
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    assert_ok!(router.clone().oneshot(request).await)
}

fn post_run(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/runs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read SSE text until `needle` shows up.
async fn read_sse_until(response: Response, needle: &str) -> String {
    let mut stream = response.into_body().into_data_stream();
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !text.contains(needle) {
            let chunk = stream.next().await.expect("stream ended").unwrap();
            text.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    })
    .await
    .expect("timed out waiting for SSE data");
    text
}

#[tokio::test]
async fn health_reports_ok() {
    let (router, _orchestrator, _gate) = app(AdmissionPolicy::MultiSession);
    let response = send(&router, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "ok": true }));
}

#[tokio::test]
async fn start_then_stream_item_and_complete() {
    let (router, orchestrator, gate) = app(AdmissionPolicy::MultiSession);

    let response = send(&router, post_run(&json!({ "instruction": "list files" }))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    let session_id = body["sessionId"].as_str().unwrap().to_owned();
    assert!(orchestrator.registry().contains(session_id.parse().unwrap()));

    let events = send(&router, get(&format!("/runs/{session_id}/events"))).await;
    assert_eq!(events.status(), StatusCode::OK);
    assert_eq!(events.headers()[header::CONTENT_TYPE], "text/event-stream");

    gate.notify_one();
    let text = read_sse_until(events, "event: complete").await;
    let item_at = text.find("event: item").unwrap();
    let complete_at = text.find("event: complete").unwrap();
    assert!(item_at < complete_at);
    assert!(text.contains(r#"data: {"id":"echo","text":"list files"}"#));
}

#[tokio::test]
async fn snapshot_lists_events_so_far() {
    let (router, orchestrator, gate) = app(AdmissionPolicy::MultiSession);
    let response = send(&router, post_run(&json!({ "instruction": "build" }))).await;
    let session_id = json_body(response).await["sessionId"]
        .as_str()
        .unwrap()
        .to_owned();

    let session = orchestrator
        .registry()
        .get(session_id.parse().unwrap())
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.snapshot().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let response = send(&router, get(&format!("/runs/{session_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = json_body(response).await;
    assert_eq!(snapshot["sessionId"], session_id.as_str());
    assert_eq!(snapshot["state"], "running");
    assert_eq!(snapshot["events"][0]["kind"], "item");
    gate.notify_one();
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (router, _orchestrator, _gate) = app(AdmissionPolicy::MultiSession);

    let random = uuid::Uuid::new_v4();
    let response = send(&router, get(&format!("/runs/{random}/events"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(json_body(response).await["error"].is_string());

    let response = send(&router, get("/runs/not-a-uuid/events")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blank_or_malformed_instruction_is_bad_request() {
    let (router, orchestrator, _gate) = app(AdmissionPolicy::MultiSession);

    let response = send(&router, post_run(&json!({ "instruction": "   " }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let malformed = Request::builder()
        .method("POST")
        .uri("/runs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = send(&router, malformed).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn single_flight_conflicts_then_returns_buffered_result() {
    let (router, orchestrator, gate) = app(AdmissionPolicy::SingleFlight);

    let first = tokio::spawn(
        router
            .clone()
            .oneshot(post_run(&json!({ "instruction": "build project" }))),
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        while !orchestrator.admission().is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let second = send(&router, post_run(&json!({ "instruction": "build project" }))).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    gate.notify_one();
    let response = assert_ok!(assert_ok!(first.await));
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["items"], json!([{ "id": "echo", "text": "build project" }]));
    assert_eq!(body["lastId"], "echo");
    assert!(body.get("error").is_none());

    // No session stream in this mode.
    let random = uuid::Uuid::new_v4();
    let response = send(&router, get(&format!("/runs/{random}/events"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn single_flight_failure_is_server_error() {
    let (router, _orchestrator, gate) = app(AdmissionPolicy::SingleFlight);
    gate.notify_one();

    let response = send(&router, post_run(&json!({ "instruction": "fail the build" }))).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"], "disk full");
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn start_after_shutdown_is_unavailable() {
    let (router, orchestrator, _gate) = app(AdmissionPolicy::MultiSession);
    orchestrator.shutdown().await;

    let response = send(&router, post_run(&json!({ "instruction": "list files" }))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(json_body(response).await["error"].is_string());
    assert!(orchestrator.registry().is_empty());
}
