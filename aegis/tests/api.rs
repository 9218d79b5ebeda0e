//! HTTP surface smoke tests, driven straight through the axum router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::{spec, TestDaemon};

async fn call(
    daemon: &TestDaemon,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let app = aegis::api::build_router(daemon.manager.clone());
    let request = match body {
        Some(value) => Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            json!({"raw": String::from_utf8_lossy(&bytes).to_string()})
        })
    };
    (status, value)
}

#[tokio::test(flavor = "multi_thread")]
async fn create_get_list_delete_round_trip() {
    let daemon = TestDaemon::new().await;

    let (status, created) = call(
        &daemon,
        "POST",
        "/v1/instances",
        Some(json!({
            "handle": "web",
            "image": "alpine:3.20",
            "command": ["sleep", "infinity"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["state"], "running", "create+start boots the vm");
    let id = created["id"].as_str().unwrap().to_string();

    // Lookup by handle and by id both resolve.
    let (status, by_handle) = call(&daemon, "GET", "/v1/instances/web", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_handle["id"], id.as_str());

    let (status, listed) = call(&daemon, "GET", "/v1/instances?state=running", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = call(&daemon, "DELETE", &format!("/v1/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&daemon, "GET", "/v1/instances/web", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_handle_is_409_state_conflict() {
    let daemon = TestDaemon::new().await;
    daemon.manager.create(spec(Some("web"))).await.unwrap();

    let (status, body) = call(
        &daemon,
        "POST",
        "/v1/instances",
        Some(json!({
            "handle": "web",
            "image": "alpine:3.20",
            "command": ["sleep", "1"],
            "start": false,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "state_conflict");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("handle \"web\" already exists"),
        "{body}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_instance_is_404() {
    let daemon = TestDaemon::new().await;
    let (status, body) = call(&daemon, "GET", "/v1/instances/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_verbs_round_trip() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(Some("svc"))).await.unwrap();
    let id = record.id.as_str().to_string();

    let (status, body) = call(&daemon, "POST", &format!("/v1/instances/{id}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");

    let (_, body) = call(&daemon, "POST", &format!("/v1/instances/{id}/pause"), None).await;
    assert_eq!(body["state"], "paused");

    let (_, body) = call(&daemon, "POST", &format!("/v1/instances/{id}/resume"), None).await;
    assert_eq!(body["state"], "running");

    let (_, body) = call(&daemon, "POST", &format!("/v1/instances/{id}/disable"), None).await;
    assert_eq!(body["state"], "disabled");
    assert_eq!(body["enabled"], false);

    // Pause on a disabled instance is a clean 409.
    let (status, body) = call(&daemon, "POST", &format!("/v1/instances/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "state_conflict");
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_endpoint_streams_ndjson() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();
    daemon.manager.start(&id).await.unwrap();

    let app = aegis::api::build_router(daemon.manager.clone());
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/instances/{id}/exec"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"argv": ["hi"]}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );

    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(raw.ends_with('\n'), "stream ends with a newline");

    let lines: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("each chunk is one complete JSON object"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["data"], "hi\n");
    assert_eq!(lines[1]["done"], true);
    assert_eq!(lines[1]["exit_code"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn secrets_crud_never_leaks_values() {
    let daemon = TestDaemon::new().await;

    let (status, _) = call(
        &daemon,
        "PUT",
        "/v1/secrets/API_KEY",
        Some(json!({"value": "hunter2"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, listed) = call(&daemon, "GET", "/v1/secrets", None).await;
    assert_eq!(status, StatusCode::OK);
    let listing = listed.to_string();
    assert!(listing.contains("API_KEY"));
    assert!(!listing.contains("hunter2"), "values never leave the vault");

    let (status, one) = call(&daemon, "GET", "/v1/secrets/API_KEY", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["name"], "API_KEY");
    assert!(one.get("value").is_none());

    let (status, _) = call(&daemon, "DELETE", "/v1/secrets/API_KEY", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&daemon, "GET", "/v1/secrets/API_KEY", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn tether_inject_and_poll() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(Some("chat"))).await.unwrap();
    let id = record.id.as_str().to_string();

    let (status, body) = call(
        &daemon,
        "POST",
        &format!("/v1/instances/{id}/tether"),
        Some(json!({
            "v": 1,
            "type": "user.message",
            "ts": chrono::Utc::now(),
            "session": {"channel": "cli", "id": "s1"},
            "payload": {"text": "hello"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["seq"], 1);

    let (status, polled) = call(
        &daemon,
        "GET",
        &format!("/v1/instances/{id}/tether/poll?after_seq=0&timeout_ms=0"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let frames = polled["frames"].as_array().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "user.message");
    assert_eq!(frames[0]["seq"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn expose_endpoints_and_status() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    let (status, bound) = call(
        &daemon,
        "POST",
        &format!("/v1/instances/{id}/expose"),
        Some(json!({"guest_port": 80})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let public = bound["public_port"].as_u64().unwrap();
    assert_ne!(public, 0);

    let (status, _) = call(
        &daemon,
        "DELETE",
        &format!("/v1/instances/{id}/expose/80"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, report) = call(&daemon, "GET", "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["backend"], "fake");
    assert_eq!(report["instances"], 1);

    let (status, kits) = call(&daemon, "GET", "/v1/kits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(kits["kits"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn logs_endpoint_replays_ndjson() {
    let daemon = TestDaemon::new().await;
    let record = daemon.manager.create(spec(None)).await.unwrap();
    let id = record.id.as_str().to_string();

    let app = aegis::api::build_router(daemon.manager.clone());
    let request = Request::builder()
        .method("GET")
        .uri(format!("/v1/instances/{id}/logs"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(!lines.is_empty(), "create pre-populates the life log");
    assert_eq!(lines[0]["event"], "created");
}

#[tokio::test(flavor = "multi_thread")]
async fn prune_endpoint_parses_durations() {
    let daemon = TestDaemon::new().await;
    let (status, _) = call(
        &daemon,
        "POST",
        "/v1/instances/prune?older_than=24h",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &daemon,
        "POST",
        "/v1/instances/prune?older_than=soon",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}
