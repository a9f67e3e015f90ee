//! API integration tests.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{TestContext, test_context};

use clawbridge::api::create_router;
use clawbridge::events::EventForwarder;

const BOUNDARY: &str = "clawbridge-test-boundary";

fn router(ctx: &TestContext) -> Router {
    create_router(ctx.state.clone())
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).method(Method::GET);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn json_request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Multipart body with one text field and N images of the given size.
fn multipart_body(text: &str, image_count: usize, image_size: usize) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"text\"\r\n\r\n{text}\r\n"
        )
        .as_bytes(),
    );
    for index in 0..image_count {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"images\"; \
                 filename=\"img{index}.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend(std::iter::repeat_n(0u8, image_size));
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, token: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 128 * 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Parse an SSE body into its JSON frames.
fn sse_frames(raw: &str) -> Vec<Value> {
    raw.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|json| serde_json::from_str(json).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let ctx = test_context().await;
    let response = router(&ctx).oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["service"], "clawbridge");
    assert!(body["data"]["gateway"].as_str().unwrap().starts_with("ws://"));
    assert!(body["data"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_auth_verify_success() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(json_request(
            Method::POST,
            "/api/auth/verify",
            None,
            json!({"token": "good"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["verified"], true);

    // One socket was opened for the probe and closed again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.gateway.socket_count(), 1);
    assert_eq!(ctx.gateway.live_connections(), 0);
}

#[tokio::test]
async fn test_auth_verify_invalid_token() {
    let ctx = test_context().await;
    ctx.gateway.reject_token("bad");

    let response = router(&ctx)
        .oneshot(json_request(
            Method::POST,
            "/api/auth/verify",
            None,
            json!({"token": "bad"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn test_auth_verify_empty_token() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(json_request(
            Method::POST,
            "/api/auth/verify",
            None,
            json!({"token": ""}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_protected_routes_require_bearer() {
    let ctx = test_context().await;
    let response = router(&ctx).oneshot(get("/api/sessions", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    // A malformed scheme is as bad as no header.
    let request = Request::builder()
        .uri("/api/sessions")
        .header(header::AUTHORIZATION, "Basic abc")
        .body(Body::empty())
        .unwrap();
    let response = router(&ctx).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_concurrent_session_lists_share_one_connection() {
    let ctx = test_context().await;
    ctx.gateway
        .set_response("sessions.list", json!([{"sessionKey": "s1", "title": "First"}]));

    let app = router(&ctx);
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            app.oneshot(get("/api/sessions", Some("good"))).await.unwrap()
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"][0]["key"], "s1");
    }

    assert_eq!(ctx.gateway.connect_count(), 1, "one connect handshake");
    assert_eq!(ctx.gateway.frames_for("sessions.list").len(), 10);
}

#[tokio::test]
async fn test_create_session() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(json_request(
            Method::POST,
            "/api/sessions",
            Some("good"),
            json!({"title": "My chat"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let key = body["data"]["key"].as_str().unwrap().to_string();
    assert!(key.starts_with("webchat-"));
    assert_eq!(body["data"]["title"], "My chat");
    assert_eq!(body["data"]["archived"], false);

    let frames = ctx.gateway.frames_for("sessions.reset");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["params"]["key"].as_str().unwrap(), key);
}

#[tokio::test]
async fn test_list_messages_normalizes_history() {
    let ctx = test_context().await;
    ctx.gateway.set_response(
        "chat.history",
        json!({"messages": [
            {"id": "m1", "role": "user", "text": "hi",
             "createdAt": "2026-01-01T00:00:00Z"},
            {"role": "assistant", "content": [
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": "world"},
            ]},
        ]}),
    );

    let response = router(&ctx)
        .oneshot(get("/api/sessions/s1/messages", Some("good")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let messages = body["data"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["id"], "m1");
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["text"], "Hello\nworld");
    assert_eq!(messages[1]["sessionKey"], "s1");

    let frames = ctx.gateway.frames_for("chat.history");
    assert_eq!(frames[0]["params"]["sessionKey"], "s1");
    assert_eq!(frames[0]["params"]["limit"], 200);
}

#[tokio::test]
async fn test_post_message_blocks_until_accepted() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages",
            "good",
            multipart_body("Hi there", 1, 64),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["data"]["accepted"], true);

    let frames = ctx.gateway.frames_for("chat.send");
    assert_eq!(frames.len(), 1);
    let params = &frames[0]["params"];
    assert_eq!(params["sessionKey"], "s1");
    assert_eq!(params["message"], "Hi there");
    assert_eq!(params["deliver"], true);
    assert!(params["idempotencyKey"].as_str().is_some());
    assert_eq!(params["attachments"][0]["mimeType"], "image/png");
}

#[tokio::test]
async fn test_upload_limits() {
    let ctx = test_context().await;

    // Too many images.
    let response = router(&ctx)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages",
            "good",
            multipart_body("x", 11, 8),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    // One image over the size limit.
    let response = router(&ctx)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages",
            "good",
            multipart_body("x", 1, 10 * 1024 * 1024 + 1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // No text and no images.
    let response = router(&ctx)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages",
            "good",
            multipart_body("", 0, 0),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing reached the gateway.
    assert!(ctx.gateway.frames_for("chat.send").is_empty());
}

#[tokio::test]
async fn test_archive_roundtrip_via_patch() {
    let ctx = test_context().await;
    ctx.gateway
        .set_response("sessions.list", json!([{"sessionKey": "s1"}]));
    let app = router(&ctx);

    let list = |app: Router| async move {
        let response = app.oneshot(get("/api/sessions", Some("good"))).await.unwrap();
        body_json(response).await
    };

    let body = list(app.clone()).await;
    assert_eq!(body["data"][0]["archived"], false);

    let response = app
        .clone()
        .oneshot(json_request(
            Method::PATCH,
            "/api/sessions/s1",
            Some("good"),
            json!({"archived": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["sessionKey"], "s1");
    assert_eq!(body["data"]["archived"], true);

    let body = list(app.clone()).await;
    assert_eq!(body["data"][0]["archived"], true);

    let response = app
        .clone()
        .oneshot(json_request(
            Method::PATCH,
            "/api/sessions/s1",
            Some("good"),
            json!({"archived": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = list(app.clone()).await;
    assert_eq!(body["data"][0]["archived"], false);

    // Archiving is process-local: nothing about it reached the gateway.
    assert!(ctx.gateway.frames_for("sessions.patch").is_empty());
}

#[tokio::test]
async fn test_rename_via_patch() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(json_request(
            Method::PATCH,
            "/api/sessions/s1",
            Some("good"),
            json!({"title": "Renamed", "archived": true}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["sessionKey"], "s1");
    assert_eq!(body["data"]["title"], "Renamed");
    assert_eq!(body["data"]["archived"], true);

    let frames = ctx.gateway.frames_for("sessions.patch");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["params"]["key"], "s1");
    assert_eq!(frames[0]["params"]["label"], "Renamed");
}

#[tokio::test]
async fn test_patch_with_no_fields_is_rejected() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(json_request(
            Method::PATCH,
            "/api/sessions/s1",
            Some("good"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_session() {
    let ctx = test_context().await;
    let response = router(&ctx)
        .oneshot(
            Request::builder()
                .uri("/api/sessions/s1")
                .method(Method::DELETE)
                .header(header::AUTHORIZATION, "Bearer good")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["closed"], true);
    assert_eq!(body["data"]["sessionKey"], "s1");
    assert_eq!(ctx.gateway.frames_for("sessions.delete").len(), 1);
}

#[tokio::test]
async fn test_streaming_happy_path() {
    let ctx = test_context().await;
    ctx.gateway.set_events_before_response(
        "chat.send",
        vec![
            json!({"type": "event", "event": "agent",
                   "payload": {"sessionKey": "s1", "stream": "assistant", "data": {"delta": "Hel"}}}),
            json!({"type": "event", "event": "agent",
                   "payload": {"sessionKey": "s1", "stream": "assistant", "data": {"delta": "lo"}}}),
            json!({"type": "event", "event": "chat",
                   "payload": {"sessionKey": "s1", "state": "final",
                                "message": {"role": "assistant", "content": "Hello"}}}),
        ],
    );

    let response = router(&ctx)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages/stream",
            "good",
            multipart_body("Hi", 0, 0),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let frames = sse_frames(std::str::from_utf8(&bytes).unwrap());

    assert_eq!(frames.len(), 4, "{frames:?}");
    assert_eq!(frames[0], json!({"type": "status", "status": "sending"}));
    assert_eq!(frames[1], json!({"type": "chunk", "text": "Hel"}));
    assert_eq!(frames[2], json!({"type": "chunk", "text": "lo"}));
    assert_eq!(frames[3], json!({"type": "done", "accepted": true}));
}

#[tokio::test]
async fn test_streaming_error_emits_error_frame() {
    let ctx = test_context().await;
    ctx.gateway.set_error_response("chat.send", "OVERLOADED");

    let response = router(&ctx)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages/stream",
            "good",
            multipart_body("Hi", 0, 0),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let frames = sse_frames(std::str::from_utf8(&bytes).unwrap());

    assert_eq!(frames[0]["type"], "status");
    let last = frames.last().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["code"], "GATEWAY_RPC_ERROR");
    // No done frame after an error.
    assert!(frames.iter().all(|f| f["type"] != "done"));
}

#[tokio::test]
async fn test_streaming_disabled_returns_503() {
    let gateway = common::MockGateway::start().await;
    let mut config = common::test_config(&gateway);
    config.streaming_enabled = false;
    let state = clawbridge::api::AppState::new(config);

    let response = create_router(state)
        .oneshot(multipart_request(
            "/api/sessions/s1/messages/stream",
            "good",
            multipart_body("Hi", 0, 0),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "STREAMING_DISABLED");
}

#[tokio::test]
async fn test_token_expiry_mid_session_invalidates_pool() {
    let ctx = test_context().await;
    ctx.gateway.set_error_response("sessions.list", "UNAUTHORIZED");

    let response = router(&ctx)
        .oneshot(get("/api/sessions", Some("good")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    // The pool entry is gone; the next request re-handshakes.
    assert_eq!(ctx.state.pool.entry_count(), 0);
    let response = router(&ctx)
        .oneshot(get("/api/sessions", Some("good")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(ctx.gateway.connect_count(), 2, "second call re-handshook");
}

#[tokio::test]
async fn test_persistent_events_channel() {
    let ctx = test_context().await;
    let state = ctx
        .state
        .clone()
        .with_forwarder(EventForwarder::with_intervals(
            ctx.state.pool.clone(),
            Duration::from_millis(50),
            Duration::from_millis(150),
        ));
    let forwarder = state.forwarder.clone();

    let response = create_router(state)
        .oneshot(get("/api/events", Some("good")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let mut body = response.into_body();

    // First frame is a keepalive from the compressed cadence.
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    let parsed = sse_frames(&text);
    assert_eq!(parsed[0]["type"], "keepalive");
    assert!(parsed[0]["ts"].as_i64().unwrap() > 0);

    // A pushed gateway frame arrives translated.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.gateway.push_event(json!({"type": "event", "event": "agent",
        "payload": {"sessionKey": "s1", "stream": "lifecycle", "data": {"phase": "start"}}}));

    let mut saw_agent_start = false;
    for _ in 0..5 {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        for value in sse_frames(&text) {
            if value["type"] == "agent-start" {
                assert_eq!(value["sessionKey"], "s1");
                saw_agent_start = true;
            }
        }
        if saw_agent_start {
            break;
        }
    }
    assert!(saw_agent_start, "agent-start should be forwarded");

    // Dropping the body unregisters the subscriber.
    drop(body);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(forwarder.active_tokens(), 0);
}
