//! Dashboard router tests driven with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use toolgate_core::approval::ApprovalQueue;
use toolgate_core::audit::{AuditRecord, AuditStore, JsonlStore};
use toolgate_core::policy::{load_bytes, YamlEngine};
use toolgate_core::{Direction, Verdict};

use toolgate::dashboard::{router, DashboardState};

const POLICY: &str = r#"
version: 1
settings:
  default_action: deny
rules:
  - name: allow-read
    match:
      method: tools/call
      tool: read_file
    action: allow
"#;

fn state(dir: &std::path::Path) -> DashboardState {
    let policy = load_bytes(POLICY.as_bytes()).unwrap();
    DashboardState {
        store: Arc::new(JsonlStore::new(dir.join("logs")).unwrap()),
        approvals: Arc::new(ApprovalQueue::new(Duration::from_secs(60))),
        backend: Arc::new(YamlEngine::from_policy(policy).unwrap()),
    }
}

fn record(method: &str, tool: &str, verdict: Verdict) -> AuditRecord {
    AuditRecord {
        id: String::new(),
        timestamp: chrono::Utc::now(),
        direction: Direction::Inbound,
        method: method.to_string(),
        tool: tool.to_string(),
        arguments: None,
        verdict,
        rule: "allow-read".to_string(),
        message: String::new(),
        raw_size: 42,
        duration_us: 7,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_api_stats() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    state
        .store
        .write(record("tools/call", "read_file", Verdict::Allow))
        .unwrap();
    state
        .store
        .write(record("tools/call", "write_file", Verdict::Deny))
        .unwrap();

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/v1/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = body_json(response).await;
    assert_eq!(stats["total_requests"], 2);
    assert_eq!(stats["allow_count"], 1);
    assert_eq!(stats["deny_count"], 1);
    assert_eq!(stats["by_tool"]["read_file"], 1);
}

#[tokio::test]
async fn test_api_audit_query() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    for _ in 0..3 {
        state
            .store
            .write(record("tools/call", "read_file", Verdict::Allow))
            .unwrap();
    }
    state
        .store
        .write(record("tools/call", "write_file", Verdict::Deny))
        .unwrap();

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/v1/audit?verdict=deny")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let records = body_json(response).await;
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["tool"], "write_file");
}

#[tokio::test]
async fn test_api_check_is_side_effect_free() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    let store = state.store.clone();

    let response = router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/check")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"method":"tools/call","tool":"read_file","arguments":{"path":"/tmp/a"}}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let check = body_json(response).await;
    assert_eq!(check["verdict"], "allow");
    assert_eq!(check["rule"], "allow-read");

    // No audit record was produced by the check.
    assert_eq!(store.stats().total_requests, 0);
}

#[tokio::test]
async fn test_api_check_default_deny() {
    let dir = tempfile::tempdir().unwrap();
    let response = router(state(dir.path()))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/check")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"method":"resources/read"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    let check = body_json(response).await;
    assert_eq!(check["verdict"], "deny");
    assert_eq!(check["rule"], "_default");
}

#[tokio::test]
async fn test_approve_and_deny_actions() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    let approvals = state.approvals.clone();

    // Park two submissions so there is something to act on.
    for _ in 0..2 {
        let queue = approvals.clone();
        tokio::spawn(async move {
            let cancel = tokio_util::sync::CancellationToken::new();
            let _ = queue
                .submit("tools/call", "write_file", "ask-write", "", None, &cancel)
                .await;
        });
    }
    while approvals.pending().len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let pending = approvals.pending();

    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/approval/{}/approve", pending[0].id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/approval/{}/deny", pending[1].id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    // Acting again on a resolved request is a client error.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/approval/{}/approve", pending[0].id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown ids too.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/approval/approval-999/deny")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(approvals.pending().is_empty());
}

#[tokio::test]
async fn test_audit_stream_is_sse() {
    let dir = tempfile::tempdir().unwrap();
    let response = router(state(dir.path()))
        .oneshot(
            Request::builder()
                .uri("/audit/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
}

#[tokio::test]
async fn test_html_pages_render() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    state
        .store
        .write(record("tools/call", "read_file", Verdict::Allow))
        .unwrap();
    let app = router(state);

    for path in ["/", "/audit", "/approval", "/policy"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "page {path}");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8_lossy(&bytes);
        assert!(html.contains("toolgate"), "page {path} lacks layout");
    }
}
