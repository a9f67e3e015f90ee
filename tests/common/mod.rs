//! Test utilities: a scriptable mock gateway and app builders.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use clawbridge::api::AppState;
use clawbridge::config::BridgeConfig;
use clawbridge::gateway::pool::GatewayConnector;
use clawbridge::gateway::{RpcClient, RpcClientOptions};

#[derive(Default)]
pub struct MockGatewayState {
    /// Every `req` frame received, in arrival order.
    requests: Mutex<Vec<Value>>,
    connect_count: AtomicUsize,
    socket_count: AtomicUsize,
    /// Tokens refused at the WebSocket upgrade with HTTP 401.
    reject_tokens: Mutex<HashSet<String>>,
    /// Error code returned in the connect response, if set.
    connect_error: Mutex<Option<String>>,
    /// method -> result payload for successful responses.
    responses: Mutex<HashMap<String, Value>>,
    /// method -> error code for failing responses.
    error_responses: Mutex<HashMap<String, String>>,
    /// Methods that never get a response.
    silent_methods: Mutex<HashSet<String>>,
    /// method -> push frames sent before the response.
    events_before_response: Mutex<HashMap<String, Vec<Value>>>,
    /// Outbound channels of live connections.
    clients: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    live_count: AtomicUsize,
    last_token: Mutex<Option<String>>,
}

/// A scriptable in-process gateway speaking the WebSocket RPC protocol.
pub struct MockGateway {
    pub addr: SocketAddr,
    state: Arc<MockGatewayState>,
}

impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock gateway");
        let addr = listener.local_addr().expect("mock gateway addr");
        let state = Arc::new(MockGatewayState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn frames_for(&self, method: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|frame| frame["method"] == method)
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    pub fn socket_count(&self) -> usize {
        self.state.socket_count.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.state.last_token.lock().unwrap().clone()
    }

    pub fn reject_token(&self, token: &str) {
        self.state
            .reject_tokens
            .lock()
            .unwrap()
            .insert(token.to_string());
    }

    pub fn set_connect_error(&self, code: &str) {
        *self.state.connect_error.lock().unwrap() = Some(code.to_string());
    }

    pub fn set_response(&self, method: &str, result: Value) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(method.to_string(), result);
    }

    pub fn set_error_response(&self, method: &str, code: &str) {
        self.state
            .error_responses
            .lock()
            .unwrap()
            .insert(method.to_string(), code.to_string());
    }

    pub fn set_silent(&self, method: &str) {
        self.state
            .silent_methods
            .lock()
            .unwrap()
            .insert(method.to_string());
    }

    pub fn set_events_before_response(&self, method: &str, events: Vec<Value>) {
        self.state
            .events_before_response
            .lock()
            .unwrap()
            .insert(method.to_string(), events);
    }

    /// Push an event frame to every live connection.
    pub fn push_event(&self, frame: Value) {
        let clients = self.state.clients.lock().unwrap();
        for tx in clients.iter() {
            let _ = tx.send(Message::Text(frame.to_string().into()));
        }
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        self.state.clients.lock().unwrap().clear();
    }

    /// Close every live connection with an explicit close code.
    pub fn close_with_code(&self, code: u16) {
        let mut clients = self.state.clients.lock().unwrap();
        for tx in clients.iter() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "test close".into(),
            })));
        }
        clients.clear();
    }

    /// Connections whose reader loop is still running.
    pub fn live_connections(&self) -> usize {
        self.state.live_count.load(Ordering::SeqCst)
    }
}

fn query_token(req: &Request) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let value = pair.strip_prefix("token=")?;
        urlencoding::decode(value).ok().map(|decoded| decoded.into_owned())
    })
}

async fn handle_connection(stream: TcpStream, state: Arc<MockGatewayState>) {
    let callback_state = Arc::clone(&state);
    let callback = move |req: &Request, response: Response| {
        let token = query_token(req).unwrap_or_default();
        *callback_state.last_token.lock().unwrap() = Some(token.clone());
        if callback_state.reject_tokens.lock().unwrap().contains(&token) {
            let mut rejection = ErrorResponse::new(Some("unauthorized".to_string()));
            *rejection.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(rejection);
        }
        Ok(response)
    };

    let socket = match accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(_) => return,
    };
    state.socket_count.fetch_add(1, Ordering::SeqCst);
    state.live_count.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.clients.lock().unwrap().push(tx.clone());

    // Writer half: drains the outbound channel; closing the channel closes
    // the socket.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || is_close {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    connection_loop(&mut source, &tx, &state).await;
    state.live_count.fetch_sub(1, Ordering::SeqCst);
}

async fn connection_loop(
    source: &mut futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<TcpStream>,
    >,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<MockGatewayState>,
) {
    while let Some(Ok(message)) = source.next().await {
        match message {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if frame["type"] != "req" {
                    continue;
                }
                state.requests.lock().unwrap().push(frame.clone());

                let id = frame["id"].as_str().unwrap_or_default().to_string();
                let method = frame["method"].as_str().unwrap_or_default().to_string();

                if method == "connect" {
                    state.connect_count.fetch_add(1, Ordering::SeqCst);
                    let error = state.connect_error.lock().unwrap().clone();
                    let response = match error {
                        Some(code) => json!({
                            "type": "res", "id": id,
                            "error": { "code": code, "message": "connect rejected" },
                        }),
                        None => json!({
                            "type": "res", "id": id,
                            "result": { "protocol": 3 },
                        }),
                    };
                    let _ = tx.send(Message::Text(response.to_string().into()));
                    continue;
                }

                if state.silent_methods.lock().unwrap().contains(&method) {
                    continue;
                }

                let events = state
                    .events_before_response
                    .lock()
                    .unwrap()
                    .get(&method)
                    .cloned()
                    .unwrap_or_default();
                for event in events {
                    let _ = tx.send(Message::Text(event.to_string().into()));
                }

                let error = state.error_responses.lock().unwrap().get(&method).cloned();
                let response = match error {
                    Some(code) => json!({
                        "type": "res", "id": id,
                        "error": { "code": code, "message": format!("{method} failed") },
                    }),
                    None => {
                        let result = state
                            .responses
                            .lock()
                            .unwrap()
                            .get(&method)
                            .cloned()
                            .unwrap_or_else(|| json!({}));
                        json!({ "type": "res", "id": id, "result": result })
                    }
                };
                let _ = tx.send(Message::Text(response.to_string().into()));
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

/// Connector that counts how many clients the pool constructs.
pub struct CountingConnector {
    pub builds: Arc<AtomicUsize>,
}

impl GatewayConnector for CountingConnector {
    fn build(&self, opts: RpcClientOptions) -> Arc<RpcClient> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Arc::new(RpcClient::new(opts))
    }
}

/// A mock gateway plus app state wired against it.
pub struct TestContext {
    pub gateway: MockGateway,
    pub state: AppState,
    pub connector_builds: Arc<AtomicUsize>,
}

pub fn test_config(gateway: &MockGateway) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.gateway_ws_url = gateway.url();
    config.gateway_connect_timeout_ms = 2_000;
    config.gateway_request_timeout_ms = 2_000;
    config.gateway_heartbeat_interval_ms = 0;
    config.gateway_reconnect_max_retries = 0;
    config
}

pub async fn test_context() -> TestContext {
    let gateway = MockGateway::start().await;
    let config = test_config(&gateway);
    let builds = Arc::new(AtomicUsize::new(0));
    let connector = Arc::new(CountingConnector {
        builds: Arc::clone(&builds),
    });
    let state = AppState::with_connector(config, connector);
    TestContext {
        gateway,
        state,
        connector_builds: builds,
    }
}

/// Client options pointed at the mock gateway.
pub fn client_options(gateway: &MockGateway, token: &str) -> RpcClientOptions {
    test_config(gateway).client_options(token)
}
