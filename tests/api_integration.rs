//! Integration tests for the control API.
//!
//! Each test builds the real router over an in-memory database and a
//! stub executor, then drives it with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use relayflow::api::{ApiState, api_routes};
use relayflow::config::SupervisorConfig;
use relayflow::store::{LibSqlBackend, WorkflowStore};
use relayflow::supervisor::{LeasedWakeLock, Supervisor};
use relayflow::workflow::{
    WorkflowDefinition, WorkflowExecutionResult, WorkflowExecutor, WorkflowRunner,
};

/// Executor that never touches the network.
#[derive(Default)]
struct StubExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl WorkflowExecutor for StubExecutor {
    async fn execute(&self, _workflow: &WorkflowDefinition) -> WorkflowExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        WorkflowExecutionResult::success("Delivered 1 message(s)", 1)
    }
}

struct TestApp {
    router: Router,
    supervisor: Supervisor,
    executor: Arc<StubExecutor>,
}

async fn app() -> TestApp {
    let store: Arc<dyn WorkflowStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let executor = Arc::new(StubExecutor::default());
    let runner = Arc::new(WorkflowRunner::new(executor.clone(), Arc::clone(&store)));
    let supervisor = Supervisor::new(
        runner,
        Arc::clone(&store),
        SupervisorConfig::default(),
        Arc::new(LeasedWakeLock::new()),
    );
    let router = api_routes(ApiState {
        store,
        supervisor: supervisor.clone(),
    });
    TestApp {
        router,
        supervisor,
        executor,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn digest_spec(interval_secs: u64) -> Value {
    json!({
        "name": "Inbox digest",
        "configuration": {
            "type": "EMAIL_TO_TELEGRAM",
            "chat_id": "42",
            "processing": { "mode": "batch", "size": 5 }
        },
        "interval_secs": interval_secs
    })
}

async fn create(router: &Router) -> String {
    let (status, body) = send(router, "POST", "/api/workflows", Some(digest_spec(300))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_and_fetch_workflow() {
    let app = app().await;
    let id = create(&app.router).await;

    let (status, body) = send(&app.router, "GET", &format!("/api/workflows/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Inbox digest");
    assert_eq!(body["type"], "EMAIL_TO_TELEGRAM");
    assert_eq!(body["is_running"], false);
    assert_eq!(body["configuration"]["processing"]["size"], 5);

    let (status, body) = send(&app.router, "GET", "/api/workflows", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn short_interval_is_a_bad_request() {
    let app = app().await;
    let (status, body) = send(&app.router, "POST", "/api/workflows", Some(digest_spec(10))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("60s"));
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn interval_beyond_ceiling_is_a_bad_request() {
    let app = app().await;
    let (status, body) =
        send(&app.router, "POST", "/api/workflows", Some(digest_spec(u64::MAX / 2))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ceiling"));
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let app = app().await;
    for (method, uri) in [
        ("GET", "/api/workflows/nope"),
        ("DELETE", "/api/workflows/nope"),
        ("POST", "/api/workflows/nope/start"),
        ("POST", "/api/workflows/nope/run"),
    ] {
        let (status, _) = send(&app.router, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
    }
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn start_run_stop_lifecycle() {
    let app = app().await;
    let id = create(&app.router).await;

    let (status, body) = send(&app.router, "POST", &format!("/api/workflows/{id}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_running"], true);

    let (_, status_body) = send(&app.router, "GET", "/api/supervisor", None).await;
    assert_eq!(status_body["running"], true);
    assert_eq!(status_body["running_workflows"], json!([id.clone()]));
    assert_eq!(status_body["scheduled_workflows"], json!([id.clone()]));

    let (status, body) = send(&app.router, "POST", &format!("/api/workflows/{id}/run"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["processed_count"], 1);
    assert!(app.executor.calls.load(Ordering::SeqCst) >= 1);

    let (status, body) = send(&app.router, "POST", &format!("/api/workflows/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_running"], false);

    // Stop twice is fine.
    let (status, _) = send(&app.router, "POST", &format!("/api/workflows/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app.router, "GET", &format!("/api/workflows/{id}"), None).await;
    assert_eq!(body["is_running"], false);
    assert!(body["last_run_at"].is_string());
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn update_keeps_id_and_running_state() {
    let app = app().await;
    let id = create(&app.router).await;
    send(&app.router, "POST", &format!("/api/workflows/{id}/start"), None).await;

    let mut spec = digest_spec(600);
    spec["name"] = json!("Renamed");
    let (status, body) = send(&app.router, "PUT", &format!("/api/workflows/{id}"), Some(spec)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id);
    assert_eq!(body["name"], "Renamed");
    assert_eq!(body["interval_secs"], 600);
    assert_eq!(body["is_running"], true);
    assert!(app.supervisor.status().await.running_workflows.contains(&id));
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn delete_stops_and_removes() {
    let app = app().await;
    let id = create(&app.router).await;
    send(&app.router, "POST", &format!("/api/workflows/{id}/start"), None).await;

    let (status, _) = send(&app.router, "DELETE", &format!("/api/workflows/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app.router, "GET", &format!("/api/workflows/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.supervisor.status().await.running_workflows.is_empty());
    app.supervisor.shutdown().await;
}

#[tokio::test]
async fn supervisor_stop_and_start_round_trip() {
    let app = app().await;
    let id = create(&app.router).await;
    send(&app.router, "POST", &format!("/api/workflows/{id}/start"), None).await;

    let (status, body) = send(&app.router, "POST", "/api/supervisor/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["user_intent"], "stopped");
    assert_eq!(body["running_workflows"], json!([]));

    // The workflow keeps its flag so the supervisor resumes it.
    let (_, workflow) = send(&app.router, "GET", &format!("/api/workflows/{id}"), None).await;
    assert_eq!(workflow["is_running"], true);

    let (status, body) = send(&app.router, "POST", "/api/supervisor/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["user_intent"], "running");
    assert_eq!(body["running_workflows"], json!([id]));
    app.supervisor.shutdown().await;
}
