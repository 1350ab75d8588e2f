//! Integration tests for the notification API endpoints.
//!
//! Covers the full HTTP flow: ingestion and dedup, session routing, per-user
//! read state, cancellations, degradation without a schema and the upstream
//! proxy.

use axum::http::{HeaderName, StatusCode};
use axum_test::TestServer;
use opsboard_notify::{build_router, config::Config, handlers::AppState, store::Store};
use opsboard_notify::upstream::UpstreamClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER_ID: HeaderName = HeaderName::from_static("x-user-id");
const API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Build test server with the application router
fn build_test_server() -> TestServer {
    build_test_server_with(Config::default())
}

fn build_test_server_with(config: Config) -> TestServer {
    let store = Arc::new(Store::new(&config));
    let state = AppState::new(store, &config);
    TestServer::new(build_router(state)).unwrap()
}

fn message(id: i64, cabinet_id: &str, text: &str) -> Value {
    json!({
        "chatId": 100,
        "chatName": "alerts",
        "cabinetName": format!("Cabinet {cabinet_id}"),
        "cabinetId": cabinet_id,
        "message": text,
        "timestampSeconds": 1_700_000_000 + id,
        "messageId": id
    })
}

async fn save(server: &TestServer, messages: Vec<Value>) -> Value {
    let response = server
        .post("/api/notifications/save")
        .json(&json!({ "messages": messages }))
        .await;
    response.assert_status_ok();
    response.json()
}

async fn start_session(server: &TestServer, user: i64, cabinets: &[&str]) -> String {
    let cabinets: Vec<Value> = cabinets
        .iter()
        .map(|c| json!({ "idexId": c, "login": format!("login-{c}") }))
        .collect();
    let response = server
        .post("/api/sessions/start")
        .add_header(USER_ID, user.to_string())
        .json(&json!({ "comment": "shift", "cabinets": cabinets }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    body["id"].as_str().unwrap().to_string()
}

async fn unread_count(server: &TestServer, user: i64) -> u64 {
    let response = server
        .get("/api/notifications/unread-count")
        .add_header(USER_ID, user.to_string())
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    body["count"].as_u64().unwrap()
}

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = build_test_server();

    let response = server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["schema_ready"], true);
    assert!(body["version"].is_string());
    assert!(body.get("last_poll_error").is_none());
}

// =============================================================================
// Ingestion Tests
// =============================================================================

#[tokio::test]
async fn test_resubmitted_batch_is_not_duplicated() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;

    let batch = vec![message(1, "42", "first"), message(2, "42", "second")];
    let first = save(&server, batch.clone()).await;
    assert_eq!(first["results"][0]["status"], "saved_with_users");
    assert_eq!(first["results"][1]["status"], "saved_with_users");

    let second = save(&server, batch).await;
    assert_eq!(second["results"][0]["status"], "duplicate");
    assert_eq!(second["results"][1]["status"], "duplicate");

    assert_eq!(unread_count(&server, 7).await, 2);

    let metrics: Value = server.get("/api/metrics").await.json();
    assert_eq!(metrics["total_notifications"], 2);
    assert_eq!(metrics["total_duplicates"], 2);
}

#[tokio::test]
async fn test_bad_item_does_not_abort_batch() {
    let server = build_test_server();

    let body = save(
        &server,
        vec![message(1, "42", ""), message(2, "42", "fine")],
    )
    .await;

    assert_eq!(body["results"][0]["status"], "error");
    assert!(body["results"][0]["error"].is_string());
    assert_eq!(body["results"][1]["status"], "saved");
}

#[tokio::test]
async fn test_same_message_number_in_two_chats_is_kept() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;

    let mut from_b = message(1, "42", "different alert from chat B");
    from_b["chatId"] = json!(200);
    let body = save(&server, vec![message(1, "42", "alert from chat A"), from_b]).await;

    assert_eq!(body["results"][0]["status"], "saved_with_users");
    assert_eq!(body["results"][1]["status"], "saved_with_users");
    assert_ne!(body["results"][0]["id"], body["results"][1]["id"]);
    assert_eq!(unread_count(&server, 7).await, 2);
}

#[tokio::test]
async fn test_ingest_key_required_when_configured() {
    let server = build_test_server_with(Config {
        ingest_api_key: Some("poller-key".into()),
        ..Config::default()
    });
    let batch = json!({ "messages": [message(1, "42", "hello")] });

    let response = server.post("/api/notifications/save").json(&batch).await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["code"], "MISSING_API_KEY");

    server
        .post("/api/notifications/save")
        .add_header(API_KEY, "wrong".to_string())
        .json(&batch)
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .post("/api/notifications/save")
        .add_header(API_KEY, "poller-key".to_string())
        .json(&batch)
        .await
        .assert_status_ok();
}

// =============================================================================
// Routing Tests
// =============================================================================

#[tokio::test]
async fn test_routing_follows_open_sessions() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;
    start_session(&server, 8, &["42", "43"]).await;
    start_session(&server, 9, &["99"]).await;

    let body = save(&server, vec![message(1, "42", "stuck order")]).await;
    assert_eq!(body["results"][0]["status"], "saved_with_users");
    assert_eq!(body["results"][0]["userIds"], json!([7, 8]));

    let body = save(&server, vec![message(2, "77", "nobody watches")]).await;
    assert_eq!(body["results"][0]["status"], "saved");

    assert_eq!(unread_count(&server, 7).await, 1);
    assert_eq!(unread_count(&server, 8).await, 1);
    assert_eq!(unread_count(&server, 9).await, 0);
}

#[tokio::test]
async fn test_closed_session_is_not_routed() {
    let server = build_test_server();
    let session_id = start_session(&server, 7, &["42"]).await;

    save(&server, vec![message(1, "42", "before close")]).await;

    let response = server
        .post(&format!("/api/sessions/{session_id}/end"))
        .add_header(USER_ID, "7".to_string())
        .await;
    response.assert_status_ok();
    let ended: Value = response.json();
    assert!(ended["endTime"].is_string());
    assert!(ended["duration"].is_number());

    let body = save(&server, vec![message(2, "42", "after close")]).await;
    assert_eq!(body["results"][0]["status"], "saved");
    assert_eq!(unread_count(&server, 7).await, 1);
}

#[tokio::test]
async fn test_header_is_parsed_for_routing_and_display() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;

    let body = save(
        &server,
        vec![json!({
            "chatId": 5,
            "message": "[X#42] Автоматическое оповещение: order delayed",
            "timestamp": 1_700_000_000,
            "messageId": "900"
        })],
    )
    .await;
    assert_eq!(body["results"][0]["status"], "saved_with_users");
    assert!(body["results"][0]["id"].as_i64().unwrap() > 0);

    let unread: Value = server
        .get("/api/notifications/unread")
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert_eq!(unread[0]["id"], body["results"][0]["id"]);
    assert_eq!(unread[0]["cabinetId"], "42");
    assert_eq!(unread[0]["cabinetName"], "X");
    assert_eq!(unread[0]["displayMessage"], "[X#42] order delayed");
    assert_eq!(unread[0]["timestamp"], 1_700_000_000_000_i64);
}

// =============================================================================
// Read State Tests
// =============================================================================

#[tokio::test]
async fn test_read_state_is_per_user() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;
    start_session(&server, 8, &["42"]).await;
    let body = save(&server, vec![message(1, "42", "shared")]).await;
    let id = body["results"][0]["id"].as_i64().unwrap();

    // A user without a copy cannot mark it
    let response = server
        .post(&format!("/api/notifications/{id}/read"))
        .add_header(USER_ID, "9".to_string())
        .await;
    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["code"], "FORBIDDEN");

    server
        .post(&format!("/api/notifications/{id}/read"))
        .add_header(USER_ID, "7".to_string())
        .await
        .assert_status_ok();

    assert_eq!(unread_count(&server, 7).await, 0);
    assert_eq!(unread_count(&server, 8).await, 1);

    server
        .post("/api/notifications/12345/read")
        .add_header(USER_ID, "7".to_string())
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mark_all_read_and_pagination() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;
    let batch: Vec<Value> = (1..=5).map(|i| message(i, "42", "msg")).collect();
    let body = save(&server, batch).await;
    let saved: Vec<i64> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();

    let page: Value = server
        .get("/api/notifications")
        .add_query_param("limit", 3)
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    let ids: Vec<i64> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_i64().unwrap())
        .collect();
    // Timestamps grow with the message number, so newest first
    assert_eq!(ids, vec![saved[4], saved[3], saved[2]]);
    let cursor = page["nextCursor"].as_str().unwrap().to_string();

    let page: Value = server
        .get("/api/notifications")
        .add_query_param("limit", 3)
        .add_query_param("cursor", &cursor)
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert!(page["nextCursor"].is_null());

    let response = server
        .post("/api/notifications/read-all")
        .add_header(USER_ID, "7".to_string())
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["success"], true);
    assert_eq!(unread_count(&server, 7).await, 0);
}

#[tokio::test]
async fn test_malformed_cursor_is_rejected() {
    let server = build_test_server();

    let response = server
        .get("/api/notifications")
        .add_query_param("cursor", "not-a-cursor")
        .add_header(USER_ID, "7".to_string())
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_requests_need_current_user() {
    let server = build_test_server();

    let response = server.get("/api/notifications/unread-count").await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["code"], "MISSING_USER");

    server
        .get("/api/notifications/unread-count")
        .add_header(USER_ID, "abc".to_string())
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[tokio::test]
async fn test_cancellations_are_global() {
    let server = build_test_server();
    start_session(&server, 7, &["42"]).await;

    let body = save(
        &server,
        vec![message(1, "42", "Заявку НЕВОЗМОЖНО ОБРАБОТАТЬ: reverted")],
    )
    .await;
    assert_eq!(body["results"][0]["kind"], "cancellation");
    assert_eq!(body["results"][0]["status"], "saved");
    let first = body["results"][0]["id"].as_i64().unwrap();
    assert_eq!(unread_count(&server, 7).await, 0);

    let body: Value = server
        .post("/api/notifications/save-cancellations")
        .json(&json!({ "messages": [message(2, "43", "refund failed")] }))
        .await
        .json();
    assert_eq!(body["results"][0]["kind"], "cancellation");
    let second = body["results"][0]["id"].clone();

    for user in ["7", "8"] {
        let count: Value = server
            .get("/api/cancellations/unread-count")
            .add_header(USER_ID, user.to_string())
            .await
            .json();
        assert_eq!(count["count"], 2);
    }

    server
        .post(&format!("/api/cancellations/{first}/read"))
        .add_header(USER_ID, "8".to_string())
        .await
        .assert_status_ok();
    let unread: Value = server
        .get("/api/cancellations/unread")
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert_eq!(unread.as_array().unwrap().len(), 1);
    assert_eq!(unread[0]["id"], second);

    server
        .post("/api/cancellations/read-all")
        .add_header(USER_ID, "7".to_string())
        .await
        .assert_status_ok();
    let count: Value = server
        .get("/api/cancellations/unread-count")
        .add_header(USER_ID, "8".to_string())
        .await
        .json();
    assert_eq!(count["count"], 0);
}

// =============================================================================
// Degradation Tests
// =============================================================================

#[tokio::test]
async fn test_unprovisioned_schema_degrades() {
    let server = build_test_server_with(Config {
        schema_ready: false,
        ..Config::default()
    });

    let health: Value = server.get("/health").await.json();
    assert_eq!(health["schema_ready"], false);

    let body = save(&server, vec![message(1, "42", "hello")]).await;
    assert_eq!(body["results"][0]["status"], "not_saved");
    assert_eq!(body["results"][0]["reason"], "initializing");

    assert_eq!(unread_count(&server, 7).await, 0);

    let unread: Value = server
        .get("/api/notifications/unread")
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert_eq!(unread, json!([]));

    let response = server
        .post("/api/notifications/read-all")
        .add_header(USER_ID, "7".to_string())
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["success"], true);

    let count: Value = server
        .get("/api/cancellations/unread-count")
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert_eq!(count["count"], 0);
}

#[tokio::test]
async fn test_schema_can_be_provisioned_at_runtime() {
    let server = build_test_server_with(Config {
        schema_ready: false,
        ingest_api_key: Some("poller-key".into()),
        ..Config::default()
    });
    let batch = json!({ "messages": [message(1, "42", "hello")] });

    let body: Value = server
        .post("/api/notifications/save")
        .add_header(API_KEY, "poller-key".to_string())
        .json(&batch)
        .await
        .json();
    assert_eq!(body["results"][0]["status"], "not_saved");

    server
        .post("/api/admin/schema")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let response = server
        .post("/api/admin/schema")
        .add_header(API_KEY, "poller-key".to_string())
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["schemaReady"], true);
    assert_eq!(body["provisioned"], true);

    let again: Value = server
        .post("/api/admin/schema")
        .add_header(API_KEY, "poller-key".to_string())
        .await
        .json();
    assert_eq!(again["provisioned"], false);

    let health: Value = server.get("/health").await.json();
    assert_eq!(health["schema_ready"], true);

    // The batch turned away while initializing is accepted on the next poll
    let body: Value = server
        .post("/api/notifications/save")
        .add_header(API_KEY, "poller-key".to_string())
        .json(&batch)
        .await
        .json();
    assert_eq!(body["results"][0]["status"], "saved");
}

// =============================================================================
// Work Session Tests
// =============================================================================

#[tokio::test]
async fn test_session_lifecycle() {
    let server = build_test_server();
    let session_id = start_session(&server, 7, &["42"]).await;

    // Only one open session per user
    let response = server
        .post("/api/sessions/start")
        .add_header(USER_ID, "7".to_string())
        .json(&json!({}))
        .await;
    response.assert_status(StatusCode::CONFLICT);

    let linked: Value = server
        .post(&format!("/api/sessions/{session_id}/cabinets"))
        .add_header(USER_ID, "7".to_string())
        .json(&json!({ "idexId": "43", "login": "second" }))
        .await
        .json();
    assert_eq!(linked["cabinets"], json!(["42", "43"]));

    let unlinked: Value = server
        .delete(&format!("/api/sessions/{session_id}/cabinets"))
        .add_header(USER_ID, "7".to_string())
        .json(&json!({ "idexId": "42" }))
        .await
        .json();
    assert_eq!(unlinked["cabinets"], json!(["43"]));

    // Another user cannot end it
    server
        .post(&format!("/api/sessions/{session_id}/end"))
        .add_header(USER_ID, "8".to_string())
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let active: Value = server
        .get("/api/sessions/active")
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert_eq!(active["id"], session_id.as_str());

    server
        .post(&format!("/api/sessions/{session_id}/end"))
        .add_header(USER_ID, "7".to_string())
        .await
        .assert_status_ok();

    let active: Value = server
        .get("/api/sessions/active")
        .add_header(USER_ID, "7".to_string())
        .await
        .json();
    assert!(active.is_null());

    // A new session can start after the old one closed
    start_session(&server, 7, &[]).await;
}

// =============================================================================
// Upstream Proxy Tests
// =============================================================================

#[tokio::test]
async fn test_proxy_without_upstream_is_unavailable() {
    let server = build_test_server();

    let response = server.get("/api/proxy/messages/recent").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["code"], "UPSTREAM_NOT_CONFIGURED");

    server
        .post("/api/poll/wake")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_proxy_forwards_window_and_extracts_fields() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cancellations/recent"))
        .and(query_param("hours", "24"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{ "message": "[Shop#17] невозможно обработать", "messageId": 3 }]
        })))
        .mount(&upstream)
        .await;

    let config = Config::default();
    let store = Arc::new(Store::new(&config));
    let client = UpstreamClient::new(&upstream.uri(), "key", Duration::from_secs(5)).unwrap();
    let state = AppState::new(store, &config).with_upstream(client);
    let server = TestServer::new(build_router(state)).unwrap();

    let response = server.get("/api/proxy/cancellations/recent").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["messages"][0]["cabinetId"], "17");
    assert_eq!(body["messages"][0]["cabinetName"], "Shop");
}

// =============================================================================
// Realtime Stream Tests
// =============================================================================

/// Serve the router on an ephemeral port; SSE needs a real connection
async fn spawn_http_server() -> String {
    let config = Config::default();
    let state = AppState::new(Arc::new(Store::new(&config)), &config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

/// Next `data:` payload of an SSE response
async fn next_event(response: &mut reqwest::Response, buffer: &mut String) -> Value {
    loop {
        if let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            let data: String = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if data.is_empty() {
                continue;
            }
            return serde_json::from_str(&data).unwrap();
        }
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("no event within 5s")
            .unwrap()
            .expect("stream closed");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn test_stream_carries_only_own_notifications() {
    let base = spawn_http_server().await;
    let http = reqwest::Client::new();

    for (user, cabinet) in [(7, "42"), (8, "43")] {
        http.post(format!("{base}/api/sessions/start"))
            .header("x-user-id", user.to_string())
            .json(&json!({ "cabinets": [{ "idexId": cabinet, "login": "" }] }))
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap();
    }

    let mut streams = Vec::new();
    for user in ["7", "8"] {
        let response = http
            .get(format!("{base}/api/notifications/stream"))
            .header("x-user-id", user)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        streams.push((response, String::new()));
    }

    http.post(format!("{base}/api/notifications/save"))
        .json(&json!({ "messages": [message(1, "42", "for user seven")] }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    http.post(format!("{base}/api/notifications/save-cancellations"))
        .json(&json!({ "messages": [message(2, "43", "refund failed")] }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let (seven, seven_buf) = &mut streams[0];
    let first = next_event(seven, seven_buf).await;
    assert_eq!(first["type"], "notification");
    assert_eq!(first["userId"], 7);
    assert_eq!(first["message"], "for user seven");
    let second = next_event(seven, seven_buf).await;
    assert_eq!(second["type"], "cancellation");

    // User 8 skips user 7's copy and sees only the global cancellation
    let (eight, eight_buf) = &mut streams[1];
    let first = next_event(eight, eight_buf).await;
    assert_eq!(first["type"], "cancellation");
    assert_eq!(first["message"], "refund failed");
}
