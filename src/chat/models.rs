//! Chat data model and upstream payload normalization.
//!
//! The gateway's session and message schemas have drifted across builds:
//! lists arrive bare or wrapped, keys and titles appear under two names,
//! and message text may be a flat field or an array of content parts. The
//! normalizers here absorb that drift into one stable shape.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat session as presented to browsers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Process-local flag; not persisted and not known to the gateway.
    pub archived: bool,
}

/// Message author role. Anything unrecognized from upstream is treated as
/// assistant output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("user") => Role::User,
            Some("system") => Role::System,
            _ => Role::Assistant,
        }
    }
}

/// A chat message as presented to browsers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_key: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub created_at: String,
}

/// An uploaded image, carried to the gateway as a base64 attachment.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn items_of<'a>(value: &'a Value, wrapper_key: &str) -> &'a [Value] {
    match value {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get(wrapper_key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

fn str_field<'a>(item: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| item.get(n).and_then(Value::as_str))
}

/// Normalize a `sessions.list` result. Items without any usable key are
/// dropped; missing timestamps default to now.
pub fn normalize_sessions(value: &Value) -> Vec<Session> {
    let now = now_iso();
    items_of(value, "sessions")
        .iter()
        .filter_map(|item| {
            let key = str_field(item, &["sessionKey", "key"])?.to_string();
            Some(Session {
                key,
                title: str_field(item, &["title", "label"]).map(str::to_string),
                created_at: Some(
                    str_field(item, &["createdAt"])
                        .map(str::to_string)
                        .unwrap_or_else(|| now.clone()),
                ),
                updated_at: Some(
                    str_field(item, &["updatedAt"])
                        .map(str::to_string)
                        .unwrap_or_else(|| now.clone()),
                ),
                archived: false,
            })
        })
        .collect()
}

/// Extract message text: a flat `text` field, or the newline-joined `text`
/// of every `content[]` entry whose type is "text".
fn message_text(item: &Value) -> Option<String> {
    if let Some(text) = item.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let parts: Vec<&str> = item
        .get("content")
        .and_then(Value::as_array)?
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn message_timestamp(item: &Value, now: &str) -> String {
    match item.get("createdAt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| now.to_string()),
        _ => now.to_string(),
    }
}

/// Normalize a `chat.history` result for one session.
pub fn normalize_messages(value: &Value, session_key: &str) -> Vec<ChatMessage> {
    let now = now_iso();
    items_of(value, "messages")
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let created_at = message_timestamp(item, &now);
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{session_key}-{index}-{created_at}"));
            ChatMessage {
                id,
                session_key: session_key.to_string(),
                role: Role::parse(item.get("role").and_then(Value::as_str)),
                text: message_text(item),
                created_at,
            }
        })
        .collect()
}
