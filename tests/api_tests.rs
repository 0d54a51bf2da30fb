//! Control-API tests: the real router wired to a live core (no workers),
//! driven with `tower::ServiceExt::oneshot`. The peer address seen by the
//! loopback guard is injected through request extensions.


use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower::ServiceExt;

use queuectl::api::{router, ApiState};
use test_harness::{spawn_core, TestCore};

const LOOPBACK: &str = "127.0.0.1:54321";
const REMOTE: &str = "203.0.113.9:54321";

/// The router plus the live core behind it; tests hold the core so its
/// temp dir and task outlive the requests.
async fn test_app() -> (Router, TestCore) {
    let core = spawn_core().await;
    let state = ApiState {
        core: core.core.clone(),
    };
    (router(state), core)
}

fn request(method: &str, uri: &str, peer: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let mut request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn enqueue_returns_the_full_job_record() {
    let (app, _core) = test_app().await;

    let response = app
        .oneshot(request(
            "POST",
            "/api/jobs",
            LOOPBACK,
            Some(json!({"command": "echo hi", "id": "job-1", "max_retries": 5})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["id"], "job-1");
    assert_eq!(body["state"], "pending");
    assert_eq!(body["attempts"], 0);
    assert_eq!(body["max_retries"], 5);
}

#[tokio::test]
async fn duplicate_ids_conflict() {
    let (app, _core) = test_app().await;
    let payload = json!({"command": "true", "id": "dup"});

    let first = app
        .clone()
        .oneshot(request("POST", "/api/jobs", LOOPBACK, Some(payload.clone())))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app
        .oneshot(request("POST", "/api/jobs", LOOPBACK, Some(payload)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn empty_commands_are_rejected() {
    let (app, _core) = test_app().await;

    let response = app
        .oneshot(request(
            "POST",
            "/api/jobs",
            LOOPBACK,
            Some(json!({"command": "   "})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_filters_by_state() {
    let (app, _core) = test_app().await;

    app.clone()
        .oneshot(request(
            "POST",
            "/api/jobs",
            LOOPBACK,
            Some(json!({"command": "true", "id": "p1"})),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("GET", "/api/jobs?state=pending", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/jobs?state=dead", LOOPBACK, None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert!(body.as_array().unwrap().is_empty());

    let response = app
        .oneshot(request("GET", "/api/jobs?state=bogus", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_unknown_job_is_not_found() {
    let (app, _core) = test_app().await;

    let response = app
        .oneshot(request("GET", "/api/jobs/ghost", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_reports_job_and_worker_summaries() {
    let (app, _core) = test_app().await;

    app.clone()
        .oneshot(request(
            "POST",
            "/api/jobs",
            LOOPBACK,
            Some(json!({"command": "true"})),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(request("GET", "/api/status", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["jobSummary"]["pending"], 1);
    assert_eq!(body["jobSummary"]["processing"], 0);
    assert_eq!(body["workerSummary"]["live"], 0);
}

#[tokio::test]
async fn dlq_retry_of_unknown_job_is_not_found() {
    let (app, _core) = test_app().await;

    let response = app
        .clone()
        .oneshot(request("POST", "/api/dlq/ghost/retry", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Retry-all with an empty DLQ is also not-found.
    let response = app
        .oneshot(request("POST", "/api/dlq/retry-all", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_roundtrip_and_validation() {
    let (app, _core) = test_app().await;

    let response = app
        .clone()
        .oneshot(request("GET", "/api/config", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["max_retries"], "3");

    let response = app
        .clone()
        .oneshot(request(
            "PUT",
            "/api/config/max_retries",
            LOOPBACK,
            Some(json!({"value": 5})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["max_retries"], "5");

    let response = app
        .clone()
        .oneshot(request("GET", "/api/config/max_retries", LOOPBACK, None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["max_retries"], "5");

    // Unknown key reads are 404, schema violations on writes are 400.
    let response = app
        .clone()
        .oneshot(request("GET", "/api/config/mystery", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(request(
            "PUT",
            "/api/config/tick_interval_ms",
            LOOPBACK,
            Some(json!({"value": "10"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_routes_refuse_non_loopback_peers() {
    let (app, _core) = test_app().await;

    for (method, uri) in [
        ("GET", "/api/config"),
        ("GET", "/api/config/max_retries"),
        ("POST", "/api/shutdown"),
    ] {
        let response = app
            .clone()
            .oneshot(request(method, uri, REMOTE, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method} {uri}");
    }

    let response = app
        .oneshot(request(
            "PUT",
            "/api/config/max_retries",
            REMOTE,
            Some(json!({"value": "1"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn shutdown_acknowledges_and_cancels_the_token() {
    let core = spawn_core().await;
    let app = router(ApiState {
        core: core.core.clone(),
    });

    let response = app
        .oneshot(request("POST", "/api/shutdown", LOOPBACK, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["message"], "shutting down");

    // The core cancels the shared token, which closes the listener.
    tokio::time::timeout(std::time::Duration::from_secs(1), core.token.cancelled())
        .await
        .expect("token should be cancelled by the core");
}
