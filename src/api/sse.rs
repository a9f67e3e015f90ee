//! Server-Sent Events endpoints.
//!
//! Two distinct channels share the SSE framing but nothing else: the
//! per-request stream answering one `POST .../messages/stream`, and the
//! persistent `GET /api/events` push channel fed by the event forwarder.
//! Frames are one JSON object per `data:` line.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::{Response, StatusCode},
};
use futures::{Stream, StreamExt, stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::instrument;

use super::auth::BearerToken;
use super::error::{ApiError, ApiResult};
use super::handlers::read_message_form;
use super::state::AppState;
use crate::chat::StreamEvent;
use crate::events::{EventForwarder, PushEvent};
use crate::gateway::GatewayError;

/// One SSE frame carrying a JSON object.
fn sse_frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

fn error_frame(err: GatewayError) -> Bytes {
    let message = err.to_string();
    let api: ApiError = err.into();
    sse_frame(&json!({
        "type": "error",
        "code": api.error_code(),
        "message": message,
    }))
}

/// Build an SSE response around a byte stream.
fn sse_response(
    stream: impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
) -> Result<Response<Body>, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        // Disable nginx buffering if present
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::internal(format!("failed to build SSE response: {err}")))
}

/// Per-request streaming send.
///
/// Emits `status: sending` immediately, relays chunks as the assistant
/// produces them, and finishes with `done` (or `error`, after which no
/// `done` follows).
#[instrument(skip(state, token, multipart))]
pub async fn message_stream(
    State(state): State<AppState>,
    token: BearerToken,
    Path(key): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Response<Body>> {
    if !state.config.streaming_enabled {
        return Err(ApiError::StreamingDisabled);
    }
    let (text, images) = read_message_form(&mut multipart).await?;

    let sessions = Arc::clone(&state.sessions);
    let bearer = token.0.clone();
    let start =
        async move { sessions.send_stream(&bearer, &key, &text, &images).await };

    let status = sse_frame(&json!({ "type": "status", "status": "sending" }));
    let relay = stream::once(start).flat_map(|result| match result {
        Ok(message_stream) => message_stream
            .map(|item| match item {
                Ok(StreamEvent::Chunk(text)) => {
                    sse_frame(&json!({ "type": "chunk", "text": text }))
                }
                Ok(StreamEvent::Done(_)) => {
                    sse_frame(&json!({ "type": "done", "accepted": true }))
                }
                Err(err) => error_frame(err),
            })
            .boxed(),
        Err(err) => stream::once(async move { error_frame(err) }).boxed(),
    });

    let body = stream::once(async move { status })
        .chain(relay)
        .map(Ok::<Bytes, Infallible>);
    sse_response(body)
}

/// Unregisters the subscriber when the browser goes away, however the
/// stream ends.
struct SubscriberGuard {
    forwarder: Arc<EventForwarder>,
    token: String,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.forwarder.unsubscribe(&self.token, self.id);
    }
}

/// Push events for one subscriber, alive until the receiver closes.
struct PushEventStream {
    rx: mpsc::UnboundedReceiver<PushEvent>,
    _guard: SubscriberGuard,
}

impl Stream for PushEventStream {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Persistent push channel. Stays open until the client aborts; gateway
/// drops are absorbed by the forwarder, never surfaced here.
#[instrument(skip(state, token))]
pub async fn events(
    State(state): State<AppState>,
    token: BearerToken,
) -> ApiResult<Response<Body>> {
    let (id, rx) = state.forwarder.subscribe(token.as_str());
    let guard = SubscriberGuard {
        forwarder: Arc::clone(&state.forwarder),
        token: token.0.clone(),
        id,
    };

    let body = PushEventStream { rx, _guard: guard }
        .map(|event| match serde_json::to_value(&event) {
            Ok(value) => sse_frame(&value),
            Err(_) => Bytes::new(),
        })
        .map(Ok::<Bytes, Infallible>);
    sse_response(body)
}
