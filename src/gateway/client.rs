//! WebSocket RPC client for the gateway.
//!
//! One `RpcClient` owns one WebSocket connection. The connect handshake is
//! mandatory: immediately after the socket opens, a single `connect` request
//! is sent and no other request may go out until its response has arrived.
//! Requests are correlated by id through a pending map; push events are
//! dispatched to subscribed callbacks, with `"*"` matching every event.
//!
//! Outbound frames are serialized through a writer task fed by a channel, so
//! heartbeats, requests and pong replies never interleave on the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use uuid::Uuid;

use super::error::{GatewayError, GatewayResult};
use super::protocol::{
    ConnectIdentity, EventFrame, Frame, ResponseFrame, connect_params, is_auth_close_code,
    is_auth_code, parse_frame, request_frame,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Callback invoked for each matching push event.
pub type EventCallback = Arc<dyn Fn(&EventFrame) + Send + Sync>;

/// Options for one client connection.
#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    /// Gateway WebSocket URL (without the token query parameter).
    pub url: String,
    /// Bearer token, appended as `?token=<urlencoded>`.
    pub token: String,
    /// Optional Origin header for the upgrade request.
    pub origin: Option<String>,
    /// Bounds the WebSocket upgrade plus the connect handshake.
    pub connect_timeout: Duration,
    /// Bounds each RPC request.
    pub request_timeout: Duration,
    /// WebSocket ping cadence after the handshake; zero disables.
    pub heartbeat_interval: Duration,
    /// Linear-backoff reconnect attempts after an abnormal close; zero
    /// disables (the pool always disables this and re-creates instead).
    pub reconnect_max_retries: u32,
    /// Base delay for reconnects; attempt N waits N times this.
    pub reconnect_delay: Duration,
    /// When false, certificate verification is disabled for this socket.
    pub tls_verify: bool,
    pub client_id: String,
    pub client_version: String,
    pub client_instance_id: String,
}

/// Connection lifecycle. `Closed` is terminal; a closed client is never
/// reopened, a new instance must be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting,
    HandshakePending,
    Ready,
    Closed,
}

struct ListenerTable {
    exact: HashMap<String, Vec<(u64, EventCallback)>>,
    wildcard: Vec<(u64, EventCallback)>,
    next_id: u64,
}

struct Inner {
    opts: RpcClientOptions,
    state: Mutex<ClientState>,
    /// Serializes connect attempts so concurrent callers share one handshake.
    connect_gate: tokio::sync::Mutex<()>,
    pending: Mutex<HashMap<String, oneshot::Sender<GatewayResult<Value>>>>,
    listeners: Mutex<ListenerTable>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    last_pong: Mutex<Option<Instant>>,
    /// Bumped whenever the underlying socket changes so tasks belonging to a
    /// previous socket become inert.
    generation: AtomicU64,
    closed_by_user: AtomicBool,
}

/// Poison-tolerant lock: the maps guarded here stay consistent even if a
/// panicking task held the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to an event subscription. Dropping it (or calling `unsubscribe`)
/// removes the callback; empty listener sets are garbage-collected.
pub struct EventSubscription {
    inner: Weak<Inner>,
    name: String,
    id: u64,
}

impl EventSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut listeners = lock(&inner.listeners);
            if self.name == "*" {
                listeners.wildcard.retain(|(id, _)| *id != self.id);
            } else if let Some(entries) = listeners.exact.get_mut(&self.name) {
                entries.retain(|(id, _)| *id != self.id);
                if entries.is_empty() {
                    listeners.exact.remove(&self.name);
                }
            }
        }
    }
}

/// One WebSocket RPC connection to the gateway.
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    pub fn new(opts: RpcClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                opts,
                state: Mutex::new(ClientState::Idle),
                connect_gate: tokio::sync::Mutex::new(()),
                pending: Mutex::new(HashMap::new()),
                listeners: Mutex::new(ListenerTable {
                    exact: HashMap::new(),
                    wildcard: Vec::new(),
                    next_id: 0,
                }),
                writer: Mutex::new(None),
                last_pong: Mutex::new(None),
                generation: AtomicU64::new(0),
                closed_by_user: AtomicBool::new(false),
            }),
        }
    }

    /// Open the WebSocket and run the connect handshake.
    ///
    /// Concurrent callers share a single in-flight handshake: the first one
    /// does the work, the rest observe the result. A client that has been
    /// closed (explicitly or by a fatal error) stays closed.
    pub async fn connect(&self) -> GatewayResult<()> {
        let _gate = self.inner.connect_gate.lock().await;
        match *lock(&self.inner.state) {
            ClientState::Ready => return Ok(()),
            ClientState::Closed => {
                return Err(GatewayError::ConnectFailed(
                    "client is closed and cannot be reused".to_string(),
                ));
            }
            _ => {}
        }

        match establish(&self.inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *lock(&self.inner.state) = ClientState::Closed;
                Err(err)
            }
        }
    }

    /// Send one RPC request and await its correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> GatewayResult<Value> {
        if !self.is_connected() {
            return Err(GatewayError::ConnectFailed(
                "gateway connection is not ready".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        let frame = request_frame(&id, method, params.as_ref());
        if let Err(err) = send_message(&self.inner, Message::Text(frame.to_string().into())) {
            lock(&self.inner.pending).remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.opts.request_timeout, rx).await {
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(GatewayError::rpc(
                    "TIMEOUT",
                    format!(
                        "request '{}' timed out after {}ms",
                        method,
                        self.inner.opts.request_timeout.as_millis()
                    ),
                ))
            }
            Ok(Err(_)) => Err(GatewayError::ConnectFailed(
                "connection closed before a response arrived".to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }

    /// Register a callback for events named `name`; `"*"` matches all.
    pub fn subscribe_event(
        &self,
        name: &str,
        callback: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> EventSubscription {
        let mut listeners = lock(&self.inner.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        let callback: EventCallback = Arc::new(callback);
        if name == "*" {
            listeners.wildcard.push((id, callback));
        } else {
            listeners
                .exact
                .entry(name.to_string())
                .or_default()
                .push((id, callback));
        }
        EventSubscription {
            inner: Arc::downgrade(&self.inner),
            name: name.to_string(),
            id,
        }
    }

    /// Close the connection. Pending requests are rejected and the client
    /// becomes permanently unusable.
    pub fn close(&self) {
        self.inner.closed_by_user.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.state) = ClientState::Closed;
        // Dropping the sender ends the writer task, which sends a close
        // frame on its way out.
        lock(&self.inner.writer).take();
        reject_pending(
            &self.inner,
            GatewayError::ConnectFailed("connection closed".to_string()),
        );
    }

    pub fn is_connected(&self) -> bool {
        *lock(&self.inner.state) == ClientState::Ready
    }

    /// Instant of the most recent pong. Purely observational; no liveness
    /// timeout is enforced here.
    pub fn last_pong_at(&self) -> Option<Instant> {
        *lock(&self.inner.last_pong)
    }

    pub fn token(&self) -> &str {
        &self.inner.opts.token
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.inner.opts.url)
            .field("state", &*lock(&self.inner.state))
            .finish()
    }
}

// ============================================================================
// Connection establishment
// ============================================================================

/// Open the socket, start the pump tasks and run the connect handshake.
/// On failure the partially built connection is torn down; the caller
/// decides whether the failure is terminal.
fn establish(
    inner: &Arc<Inner>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = GatewayResult<()>> + Send + '_>> {
    Box::pin(establish_inner(inner))
}

async fn establish_inner(inner: &Arc<Inner>) -> GatewayResult<()> {
    *lock(&inner.state) = ClientState::Connecting;

    let result = tokio::time::timeout(inner.opts.connect_timeout, do_establish(inner)).await;
    match result {
        Ok(Ok(())) => {
            *lock(&inner.state) = ClientState::Ready;
            spawn_heartbeat(inner);
            info!("gateway connection ready ({})", inner.opts.url);
            Ok(())
        }
        Ok(Err(err)) => {
            teardown(inner);
            Err(err)
        }
        Err(_) => {
            teardown(inner);
            Err(GatewayError::ConnectFailed(format!(
                "connect timed out after {}ms",
                inner.opts.connect_timeout.as_millis()
            )))
        }
    }
}

async fn do_establish(inner: &Arc<Inner>) -> GatewayResult<()> {
    let socket = dial(&inner.opts).await?;
    let (sink, source) = socket.split();

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    *lock(&inner.writer) = Some(spawn_writer(sink));
    tokio::spawn(read_loop(Arc::clone(inner), source, generation));

    *lock(&inner.state) = ClientState::HandshakePending;
    handshake(inner).await
}

/// Open the WebSocket, classifying upgrade failures.
async fn dial(
    opts: &RpcClientOptions,
) -> GatewayResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let separator = if opts.url.contains('?') { '&' } else { '?' };
    let url = format!(
        "{}{}token={}",
        opts.url,
        separator,
        urlencoding::encode(&opts.token)
    );

    let mut request = url
        .into_client_request()
        .map_err(|e| GatewayError::ConnectFailed(format!("invalid gateway url: {e}")))?;
    if let Some(origin) = &opts.origin {
        let value = HeaderValue::from_str(origin)
            .map_err(|e| GatewayError::ConnectFailed(format!("invalid origin header: {e}")))?;
        request.headers_mut().insert(ORIGIN, value);
    }

    let connector = if opts.tls_verify {
        None
    } else {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| GatewayError::ConnectFailed(format!("tls setup failed: {e}")))?;
        Some(Connector::NativeTls(tls))
    };

    let (socket, _response) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(classify_upgrade_error)?;

    Ok(socket)
}

fn classify_upgrade_error(err: WsError) -> GatewayError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                GatewayError::Unauthorized(format!(
                    "gateway rejected the connection (HTTP {status})"
                ))
            } else {
                GatewayError::ConnectFailed(format!("websocket upgrade failed (HTTP {status})"))
            }
        }
        other => GatewayError::ConnectFailed(format!("websocket connect failed: {other}")),
    }
}

/// Send the mandatory connect request and classify its response. Auth
/// errors map to `Unauthorized`, everything else to `ConnectFailed`.
async fn handshake(inner: &Arc<Inner>) -> GatewayResult<()> {
    let identity = ConnectIdentity {
        token: inner.opts.token.clone(),
        client_id: inner.opts.client_id.clone(),
        client_version: inner.opts.client_version.clone(),
        instance_id: inner.opts.client_instance_id.clone(),
    };

    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    lock(&inner.pending).insert(id.clone(), tx);

    let frame = request_frame(&id, "connect", Some(&connect_params(&identity)));
    if let Err(err) = send_message(inner, Message::Text(frame.to_string().into())) {
        lock(&inner.pending).remove(&id);
        return Err(err);
    }

    match rx.await {
        Ok(Ok(_result)) => Ok(()),
        Ok(Err(GatewayError::Unauthorized(msg))) => Err(GatewayError::Unauthorized(msg)),
        Ok(Err(GatewayError::Rpc { message, .. })) => Err(GatewayError::ConnectFailed(format!(
            "connect handshake rejected: {message}"
        ))),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(GatewayError::ConnectFailed(
            "connection closed during the connect handshake".to_string(),
        )),
    }
}

// ============================================================================
// Socket pump tasks
// ============================================================================

fn spawn_writer(mut sink: WsSink) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.flush().await;
    });
    tx
}

async fn read_loop(inner: Arc<Inner>, mut source: WsSource, generation: u64) {
    let reason = loop {
        if inner.generation.load(Ordering::SeqCst) != generation {
            // Superseded by a newer socket or torn down; drop quietly.
            return;
        }
        match source.next().await {
            Some(Ok(Message::Text(text))) => handle_text(&inner, text.as_str()),
            Some(Ok(Message::Pong(_))) => {
                *lock(&inner.last_pong) = Some(Instant::now());
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = send_message(&inner, Message::Pong(data));
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                if is_auth_close_code(code) {
                    break GatewayError::Unauthorized(format!(
                        "gateway closed the connection (code {code})"
                    ));
                }
                break GatewayError::ConnectFailed(format!(
                    "gateway closed the connection (code {code})"
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                break GatewayError::ConnectFailed(format!("websocket error: {err}"));
            }
            None => break GatewayError::ConnectFailed("websocket closed".to_string()),
        }
    };

    handle_disconnect(inner, generation, reason).await;
}

fn handle_text(inner: &Arc<Inner>, text: &str) {
    match parse_frame(text) {
        Some(Frame::Response(response)) => resolve_response(inner, response),
        Some(Frame::Event(event)) => dispatch_event(inner, &event),
        None => debug!("ignoring unclassifiable gateway frame"),
    }
}

fn resolve_response(inner: &Arc<Inner>, response: ResponseFrame) {
    let sender = lock(&inner.pending).remove(&response.id);
    match sender {
        Some(tx) => {
            let _ = tx.send(classify_response(response));
        }
        None => debug!("response for unknown request id {}", response.id),
    }
}

fn classify_response(response: ResponseFrame) -> GatewayResult<Value> {
    if let Some(error) = &response.error {
        let code = error.code_string();
        let message = error.message_string();
        if is_auth_code(&code) {
            return Err(GatewayError::Unauthorized(message));
        }
        return Err(GatewayError::Rpc {
            code,
            message,
            data: error.data.clone(),
        });
    }
    if response.ok == Some(false) {
        return Err(GatewayError::rpc("UNKNOWN", "gateway rejected the request"));
    }
    Ok(response.body())
}

/// Invoke exact-name listeners, then wildcard listeners, in registration
/// order. Callbacks are cloned out of the table first so a callback may
/// itself subscribe or unsubscribe.
fn dispatch_event(inner: &Arc<Inner>, event: &EventFrame) {
    let callbacks: Vec<EventCallback> = {
        let listeners = lock(&inner.listeners);
        let mut callbacks = Vec::new();
        if let Some(entries) = listeners.exact.get(&event.event) {
            callbacks.extend(entries.iter().map(|(_, cb)| Arc::clone(cb)));
        }
        callbacks.extend(listeners.wildcard.iter().map(|(_, cb)| Arc::clone(cb)));
        callbacks
    };
    for callback in callbacks {
        callback(event);
    }
}

fn spawn_heartbeat(inner: &Arc<Inner>) {
    let interval = inner.opts.heartbeat_interval;
    if interval.is_zero() {
        return;
    }
    let generation = inner.generation.load(Ordering::SeqCst);
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if send_message(&inner, Message::Ping(Vec::new().into())).is_err() {
                return;
            }
        }
    });
}

// ============================================================================
// Failure handling and reconnect
// ============================================================================

fn send_message(inner: &Arc<Inner>, message: Message) -> GatewayResult<()> {
    let sender = lock(&inner.writer).clone();
    let Some(sender) = sender else {
        return Err(GatewayError::ConnectFailed(
            "websocket is not open".to_string(),
        ));
    };
    sender
        .send(message)
        .map_err(|_| GatewayError::ConnectFailed("websocket send failed".to_string()))
}

fn reject_pending(inner: &Arc<Inner>, reason: GatewayError) {
    let drained: Vec<_> = lock(&inner.pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(reason.clone()));
    }
}

/// Invalidate the current socket's tasks and reject its pending requests.
fn teardown(inner: &Arc<Inner>) {
    inner.generation.fetch_add(1, Ordering::SeqCst);
    lock(&inner.writer).take();
    reject_pending(
        inner,
        GatewayError::ConnectFailed("connection closed".to_string()),
    );
}

/// Reacts to the read loop ending. Stale generations are ignored (the
/// socket was already replaced or torn down). Auth failures and explicit
/// closes are terminal; otherwise linear-backoff reconnect may run.
async fn handle_disconnect(inner: Arc<Inner>, generation: u64, reason: GatewayError) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    if inner.closed_by_user.load(Ordering::SeqCst) {
        return;
    }

    warn!("gateway connection lost: {reason}");
    inner.generation.fetch_add(1, Ordering::SeqCst);
    lock(&inner.writer).take();
    reject_pending(&inner, reason.clone());

    let auth_failure = matches!(reason, GatewayError::Unauthorized(_));
    if auth_failure || inner.opts.reconnect_max_retries == 0 {
        *lock(&inner.state) = ClientState::Closed;
        return;
    }

    *lock(&inner.state) = ClientState::Connecting;
    for attempt in 1..=inner.opts.reconnect_max_retries {
        tokio::time::sleep(inner.opts.reconnect_delay * attempt).await;
        if inner.closed_by_user.load(Ordering::SeqCst) {
            return;
        }

        let _gate = inner.connect_gate.lock().await;
        match *lock(&inner.state) {
            ClientState::Closed | ClientState::Ready => return,
            _ => {}
        }
        // establish() spawns a read loop that lands back here, so the
        // future type must be erased to stay finite.
        match establish(&inner).await {
            Ok(()) => {
                info!("gateway reconnected after {attempt} attempt(s)");
                return;
            }
            Err(GatewayError::Unauthorized(msg)) => {
                warn!("gateway reconnect rejected for auth reasons: {msg}");
                break;
            }
            Err(err) => {
                debug!(
                    "gateway reconnect attempt {attempt}/{} failed: {err}",
                    inner.opts.reconnect_max_retries
                );
            }
        }
    }

    *lock(&inner.state) = ClientState::Closed;
}
