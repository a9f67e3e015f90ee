//! Translation of raw gateway frames into browser push events.
//!
//! The gateway's push schema (`agent`/`chat` events with `stream`, `state`
//! and `data.delta` fields) was reverse-engineered and may drift; every
//! rule lives in this one module so a schema change touches nothing else.
//! Frames matching none of the rules are dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The stable event schema fanned out to browsers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PushEvent {
    /// An assistant text delta for one session.
    #[serde(rename = "chunk")]
    Chunk {
        #[serde(rename = "sessionKey")]
        session_key: String,
        text: String,
    },
    /// An agent run started.
    #[serde(rename = "agent-start")]
    AgentStart {
        #[serde(rename = "sessionKey")]
        session_key: String,
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    /// An agent run ended.
    #[serde(rename = "agent-end")]
    AgentEnd {
        #[serde(rename = "sessionKey")]
        session_key: String,
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    /// The assistant's completed message.
    #[serde(rename = "message-final")]
    MessageFinal {
        #[serde(rename = "sessionKey")]
        session_key: String,
        message: Value,
    },
    /// Emitted on a timer so proxies keep the SSE socket open.
    #[serde(rename = "keepalive")]
    Keepalive { ts: i64 },
}

fn session_key(payload: &Value) -> String {
    payload
        .get("sessionKey")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn run_id(payload: &Value) -> Option<String> {
    payload
        .get("runId")
        .or_else(|| payload.get("data").and_then(|d| d.get("runId")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Deltas are usually strings but have been observed as other scalars;
/// render those through their JSON form.
fn delta_text(delta: &Value) -> String {
    match delta {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Apply the translation rules to one frame. Returns `None` for every
/// frame browsers should not see.
pub fn translate_frame(event: &str, payload: &Value) -> Option<PushEvent> {
    match event {
        "agent" => {
            let stream = payload.get("stream").and_then(Value::as_str)?;
            let data = payload.get("data").unwrap_or(&Value::Null);
            match stream {
                "assistant" => {
                    let delta = data.get("delta")?;
                    Some(PushEvent::Chunk {
                        session_key: session_key(payload),
                        text: delta_text(delta),
                    })
                }
                "lifecycle" => match data.get("phase").and_then(Value::as_str) {
                    Some("start") => Some(PushEvent::AgentStart {
                        session_key: session_key(payload),
                        run_id: run_id(payload),
                    }),
                    Some("end") => Some(PushEvent::AgentEnd {
                        session_key: session_key(payload),
                        run_id: run_id(payload),
                    }),
                    _ => None,
                },
                _ => None,
            }
        }
        "chat" => {
            if payload.get("state").and_then(Value::as_str) != Some("final") {
                return None;
            }
            let message = payload.get("message").cloned().unwrap_or_else(|| payload.clone());
            Some(PushEvent::MessageFinal {
                session_key: session_key(payload),
                message,
            })
        }
        _ => None,
    }
}
