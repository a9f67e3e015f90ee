//! Gateway RPC wire protocol.
//!
//! The gateway speaks a framed JSON protocol over WebSocket. Three frame
//! kinds exist: `req` (client to gateway), `res` (gateway to client,
//! correlated by id) and `event` (gateway push, uncorrelated). Older gateway
//! builds used `name`/`data` instead of `event`/`payload` on event frames;
//! both spellings are accepted.

use serde_json::{Map, Value, json};

/// Protocol version offered in the connect handshake (both min and max).
pub const PROTOCOL_VERSION: u32 = 3;

/// Client id the gateway accepts for browser control surfaces.
pub const DEFAULT_CLIENT_ID: &str = "openclaw-control-ui";

/// Platform reported in the connect descriptor.
pub const CLIENT_PLATFORM: &str = "web";

/// Mode reported in the connect descriptor.
pub const CLIENT_MODE: &str = "ui";

/// Role requested by the bridge.
pub const OPERATOR_ROLE: &str = "operator";

/// Scopes requested by the bridge.
pub const OPERATOR_SCOPES: &[&str] = &[
    "operator.read",
    "operator.admin",
    "operator.approvals",
    "operator.pairing",
];

/// Whether an upstream error code is an authentication failure.
///
/// The gateway is not consistent here: auth failures surface as string
/// codes, legacy numeric codes, or `FORBIDDEN`.
pub fn is_auth_code(code: &str) -> bool {
    matches!(
        code.to_ascii_uppercase().as_str(),
        "UNAUTHORIZED" | "FORBIDDEN" | "401" | "403"
    )
}

/// Close codes the gateway uses for authentication failures.
pub fn is_auth_close_code(code: u16) -> bool {
    code == 4001 || code == 4003
}

/// Client descriptor and credentials for the connect handshake.
#[derive(Debug, Clone)]
pub struct ConnectIdentity {
    pub token: String,
    pub client_id: String,
    pub client_version: String,
    pub instance_id: String,
}

/// Build the params object for the mandatory `connect` request.
pub fn connect_params(identity: &ConnectIdentity) -> Value {
    json!({
        "minProtocol": PROTOCOL_VERSION,
        "maxProtocol": PROTOCOL_VERSION,
        "client": {
            "id": identity.client_id,
            "version": identity.client_version,
            "platform": CLIENT_PLATFORM,
            "mode": CLIENT_MODE,
            "instanceId": identity.instance_id,
        },
        "role": OPERATOR_ROLE,
        "scopes": OPERATOR_SCOPES,
        "auth": { "token": identity.token },
    })
}

/// Build an outbound request frame.
pub fn request_frame(id: &str, method: &str, params: Option<&Value>) -> Value {
    let mut frame = Map::new();
    frame.insert("type".into(), json!("req"));
    frame.insert("id".into(), json!(id));
    frame.insert("method".into(), json!(method));
    if let Some(params) = params {
        frame.insert("params".into(), params.clone());
    }
    Value::Object(frame)
}

/// Error body embedded in a response frame.
#[derive(Debug, Clone)]
pub struct ErrorBody {
    pub code: Option<Value>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl ErrorBody {
    /// Normalize the code to a string; numeric codes are stringified.
    pub fn code_string(&self) -> String {
        match &self.code {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "UNKNOWN".to_string(),
        }
    }

    pub fn message_string(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "gateway reported an error".to_string())
    }
}

/// A correlated response frame.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub id: String,
    pub result: Option<Value>,
    pub payload: Option<Value>,
    pub ok: Option<bool>,
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    /// Success is defined as no error body and `ok` not explicitly false.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.ok != Some(false)
    }

    /// The result body: `result` if present, else `payload`, else null.
    pub fn body(&self) -> Value {
        self.result
            .clone()
            .or_else(|| self.payload.clone())
            .unwrap_or(Value::Null)
    }
}

/// An uncorrelated push event frame.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub event: String,
    pub payload: Value,
    pub seq: Option<i64>,
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(ResponseFrame),
    Event(EventFrame),
}

/// Classify one inbound text frame.
///
/// Event frames accept the legacy `name`/`data` field spellings. Frames
/// whose `type` is anything other than `event` are treated as responses if
/// they carry an id, and ignored otherwise.
pub fn parse_frame(text: &str) -> Option<Frame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;

    if obj.get("type").and_then(Value::as_str) == Some("event") {
        let event = obj
            .get("event")
            .or_else(|| obj.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = obj
            .get("payload")
            .or_else(|| obj.get("data"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let seq = obj.get("seq").and_then(Value::as_i64);
        return Some(Frame::Event(EventFrame {
            event,
            payload,
            seq,
        }));
    }

    let id = obj.get("id").and_then(Value::as_str)?.to_string();
    let error = obj.get("error").and_then(|e| {
        let e = e.as_object()?;
        Some(ErrorBody {
            code: e.get("code").cloned(),
            message: e.get("message").and_then(Value::as_str).map(str::to_string),
            data: e.get("data").cloned(),
        })
    });

    Some(Frame::Response(ResponseFrame {
        id,
        result: obj.get("result").cloned(),
        payload: obj.get("payload").cloned(),
        ok: obj.get("ok").and_then(Value::as_bool),
        error,
    }))
}
