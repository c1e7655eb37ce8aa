
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use relay_exec::http::{router, HttpState, RunCodeResponse};
use relay_exec::resources::HostResourceRecord;
use relay_exec::sandbox::{ResourceLimits, SandboxExecutor};
use relay_exec::store::{MemoryStore, SharedState};
use test_harness::{sandbox_config, FakeBehavior, FakeSandbox};

const HTTP_LIMITS: ResourceLimits = ResourceLimits {
    cpu_count: 4,
    ram_bytes: 4 * 1024 * 1024 * 1024,
};

struct TestApp {
    router: Router,
    sandbox: Arc<FakeSandbox>,
    state: SharedState,
    _work_dir: tempfile::TempDir,
}

fn test_app(behavior: FakeBehavior) -> TestApp {
    let work_dir = tempfile::tempdir().unwrap();
    let sandbox = FakeSandbox::new(behavior);
    let state = SharedState::new(Arc::new(MemoryStore::new()));
    let http_state = HttpState {
        executor: SandboxExecutor::new(sandbox.clone(), sandbox_config(work_dir.path())),
        state: state.clone(),
        limits: HTTP_LIMITS,
        host_ttl: Duration::from_secs(15),
    };
    TestApp {
        router: router(http_state),
        sandbox,
        state,
        _work_dir: work_dir,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/run-code")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn multipart_request(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
    let boundary = "relay-test-boundary";
    let mut body = String::new();
    for (name, filename, content) in parts {
        body.push_str(&format!("--{}\r\n", boundary));
        match filename {
            Some(filename) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: text/x-python\r\n\r\n",
                name, filename
            )),
            None => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                name
            )),
        }
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", boundary));

    Request::builder()
        .method("POST")
        .uri("/run-code")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_run_code_json() {
    let app = test_app(FakeBehavior::default());

    let (status, body) = send(&app, json_request(r#"{"code": "print(\"HELLO-42\")"}"#)).await;

    assert_eq!(status, StatusCode::OK);
    let response: RunCodeResponse = serde_json::from_value(body).unwrap();
    assert_eq!(response.output, "HELLO-42\n");
}

#[tokio::test]
async fn test_run_code_uses_endpoint_limits() {
    let app = test_app(FakeBehavior::default());

    send(&app, json_request(r#"{"code": "print(1)"}"#)).await;

    let spec = &app.sandbox.created()[0];
    assert_eq!(spec.cpu_limit, 4.0);
    assert_eq!(spec.memory_limit, 4 * 1024 * 1024 * 1024);
}

#[tokio::test]
async fn test_run_code_form() {
    let app = test_app(FakeBehavior::default());
    let request = Request::builder()
        .method("POST")
        .uri("/run-code")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("code=print%28%22form%22%29"))
        .unwrap();

    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "form\n");
}

#[tokio::test]
async fn test_run_code_multipart_file() {
    let app = test_app(FakeBehavior::default());

    let (status, body) = send(
        &app,
        multipart_request(&[("file", Some("job.py"), "print(\"uploaded\")\n")]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "uploaded\n");
}

#[tokio::test]
async fn test_uploaded_file_wins_over_code_field() {
    let app = test_app(FakeBehavior::default());

    let (status, body) = send(
        &app,
        multipart_request(&[
            ("code", None, "print(\"field\")"),
            ("file", Some("job.py"), "print(\"file\")"),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "file\n");
}

#[tokio::test]
async fn test_multipart_code_field() {
    let app = test_app(FakeBehavior::default());

    let (status, body) = send(&app, multipart_request(&[("code", None, "print(\"field\")")])).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "field\n");
}

#[tokio::test]
async fn test_missing_code_is_bad_request() {
    let app = test_app(FakeBehavior::default());

    for request in [
        json_request("{}"),
        json_request(r#"{"code": ""}"#),
        multipart_request(&[("other", None, "x")]),
        Request::builder()
            .method("POST")
            .uri("/run-code")
            .body(Body::empty())
            .unwrap(),
    ] {
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["output"], "No code provided");
    }

    assert_eq!(app.sandbox.create_count(), 0);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let app = test_app(FakeBehavior::default());

    let (status, _) = send(&app, json_request("{not json")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.sandbox.create_count(), 0);
}

#[tokio::test]
async fn test_execution_failure_is_server_error() {
    let app = test_app(FakeBehavior {
        exit_code: 2,
        ..Default::default()
    });

    let (status, body) = send(&app, json_request(r#"{"code": "print(\"oops\")"}"#)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let output = body["output"].as_str().unwrap();
    assert!(output.contains("exited with code 2"));
    assert!(output.contains("oops"));
}

#[tokio::test]
async fn test_run_code_bypasses_store() {
    let app = test_app(FakeBehavior::default());

    send(&app, json_request(r#"{"code": "print(1)"}"#)).await;

    assert!(app.state.list_resources().await.unwrap().is_empty());
    assert!(app.state.store().list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_hosts_marks_stale_records() {
    let app = test_app(FakeBehavior::default());
    let fresh = HostResourceRecord {
        host_id: "fresh".to_string(),
        cpu_count: 8,
        ram_bytes: 16 * 1024 * 1024 * 1024,
        gpu_list: Vec::new(),
        observed_at: Utc::now(),
    };
    let stale = HostResourceRecord {
        host_id: "stale".to_string(),
        observed_at: Utc::now() - chrono::Duration::minutes(5),
        ..fresh.clone()
    };
    app.state.publish_resources(&fresh).await.unwrap();
    app.state.publish_resources(&stale).await.unwrap();

    let request = Request::builder()
        .uri("/api/hosts")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    let hosts = body.as_array().unwrap();
    assert_eq!(hosts.len(), 2);
    let by_id = |id: &str| hosts.iter().find(|h| h["host_id"] == id).unwrap().clone();
    assert_eq!(by_id("fresh")["stale"], false);
    assert_eq!(by_id("fresh")["cpu_count"], 8);
    assert_eq!(by_id("stale")["stale"], true);
}
