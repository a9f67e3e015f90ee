//! Session manager: chat business operations over the connection pool.
//!
//! Every operation is one RPC exchange on the token's pooled connection,
//! plus bookkeeping in a per-token in-memory cache. The archive flag lives
//! only here: it is process-local and resets on restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use serde_json::{Value, json};
use uuid::Uuid;

use super::models::{ChatMessage, ImageAttachment, Session, normalize_messages,
    normalize_sessions, now_iso};
use super::stream::MessageStream;
use crate::gateway::{ConnectionPool, GatewayError, GatewayResult};

const HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Clone)]
struct CachedSession {
    title: Option<String>,
    last_active_at: Instant,
}

#[derive(Default)]
struct TokenCache {
    sessions: HashMap<String, CachedSession>,
    archived: HashSet<String>,
}

/// Chat operations for authenticated tokens.
pub struct SessionManager {
    pool: Arc<ConnectionPool>,
    caches: DashMap<String, TokenCache>,
}

impl SessionManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            caches: DashMap::new(),
        }
    }

    /// One RPC on the token's pooled connection. An auth-class failure
    /// invalidates the pool entry so the next call re-handshakes (and
    /// surfaces a revoked token instead of a stuck connection).
    async fn request(&self, token: &str, method: &str, params: Value) -> GatewayResult<Value> {
        let client = self.pool.get_connection(token).await?;
        match client.request(method, Some(params)).await {
            Err(err @ GatewayError::Unauthorized(_)) => {
                self.pool.close_token(token);
                Err(err)
            }
            other => other,
        }
    }

    fn touch(&self, token: &str, key: &str, title: Option<&str>) {
        let mut cache = self.caches.entry(token.to_string()).or_default();
        let entry = cache
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| CachedSession {
                title: None,
                last_active_at: Instant::now(),
            });
        entry.last_active_at = Instant::now();
        if let Some(title) = title {
            entry.title = Some(title.to_string());
        }
    }

    /// List sessions, overlaying the process-local archive flags.
    pub async fn list(&self, token: &str) -> GatewayResult<Vec<Session>> {
        let result = self.request(token, "sessions.list", json!({})).await?;
        let mut sessions = normalize_sessions(&result);
        if let Some(cache) = self.caches.get(token) {
            for session in &mut sessions {
                session.archived = cache.archived.contains(&session.key);
            }
        }
        Ok(sessions)
    }

    /// Create a session under a freshly minted key.
    pub async fn create(&self, token: &str, title: Option<&str>) -> GatewayResult<Session> {
        let key = format!("webchat-{}", Utc::now().timestamp_millis());
        self.request(token, "sessions.reset", json!({ "key": key }))
            .await?;
        self.touch(token, &key, title);
        let now = now_iso();
        Ok(Session {
            key,
            title: title.map(str::to_string),
            created_at: Some(now.clone()),
            updated_at: Some(now),
            archived: false,
        })
    }

    /// Fetch and normalize a session's message history.
    pub async fn history(&self, token: &str, key: &str) -> GatewayResult<Vec<ChatMessage>> {
        let result = self
            .request(
                token,
                "chat.history",
                json!({ "sessionKey": key, "limit": HISTORY_LIMIT }),
            )
            .await?;
        self.touch(token, key, None);
        Ok(normalize_messages(&result, key))
    }

    /// Send a message, blocking until the gateway accepts or completes it.
    pub async fn send(
        &self,
        token: &str,
        key: &str,
        text: &str,
        images: &[ImageAttachment],
    ) -> GatewayResult<Value> {
        let params = send_params(key, text, images);
        let result = self.request(token, "chat.send", params).await?;
        self.touch(token, key, None);
        Ok(result)
    }

    /// Send a message, yielding assistant deltas as they stream in.
    pub async fn send_stream(
        &self,
        token: &str,
        key: &str,
        text: &str,
        images: &[ImageAttachment],
    ) -> GatewayResult<MessageStream> {
        let client = self.pool.get_connection(token).await?;
        self.touch(token, key, None);
        Ok(MessageStream::start(
            client,
            key.to_string(),
            send_params(key, text, images),
        ))
    }

    /// Rename a session upstream and mirror the title locally.
    pub async fn rename(&self, token: &str, key: &str, title: &str) -> GatewayResult<()> {
        self.request(token, "sessions.patch", json!({ "key": key, "label": title }))
            .await?;
        self.touch(token, key, Some(title));
        Ok(())
    }

    /// Flag a session archived. In-memory only; reset on restart.
    pub fn archive(&self, token: &str, key: &str) {
        self.caches
            .entry(token.to_string())
            .or_default()
            .archived
            .insert(key.to_string());
    }

    pub fn unarchive(&self, token: &str, key: &str) {
        if let Some(mut cache) = self.caches.get_mut(token) {
            cache.archived.remove(key);
        }
    }

    pub fn is_archived(&self, token: &str, key: &str) -> bool {
        self.caches
            .get(token)
            .map(|cache| cache.archived.contains(key))
            .unwrap_or(false)
    }

    /// Close a session upstream and drop its local state.
    pub async fn close(&self, token: &str, key: &str) -> GatewayResult<()> {
        self.request(token, "sessions.delete", json!({ "key": key }))
            .await?;
        if let Some(mut cache) = self.caches.get_mut(token) {
            cache.sessions.remove(key);
            cache.archived.remove(key);
        }
        Ok(())
    }

    /// Close several sessions in one exchange.
    pub async fn delete_many(&self, token: &str, keys: &[String]) -> GatewayResult<()> {
        self.request(token, "sessions.deleteMany", json!({ "keys": keys }))
            .await?;
        if let Some(mut cache) = self.caches.get_mut(token) {
            for key in keys {
                cache.sessions.remove(key);
                cache.archived.remove(key);
            }
        }
        Ok(())
    }

    /// Drop session cache entries idle past the threshold. Archive flags
    /// are kept; they only die with the process.
    pub fn gc_idle(&self, max_idle: Duration) {
        let mut dropped = 0usize;
        for mut cache in self.caches.iter_mut() {
            let before = cache.sessions.len();
            cache
                .sessions
                .retain(|_, s| s.last_active_at.elapsed() < max_idle);
            dropped += before - cache.sessions.len();
        }
        if dropped > 0 {
            debug!("gc dropped {dropped} idle session cache entries");
        }
    }
}

/// Params for `chat.send`. Every call carries a fresh idempotency key so
/// the gateway can deduplicate; `deliver: true` asks it to wait for the
/// assistant reply.
fn send_params(key: &str, text: &str, images: &[ImageAttachment]) -> Value {
    let mut params = json!({
        "sessionKey": key,
        "message": text,
        "deliver": true,
        "idempotencyKey": Uuid::new_v4().to_string(),
    });
    if !images.is_empty() {
        params["attachments"] = images
            .iter()
            .map(|image| {
                json!({
                    "name": image.name,
                    "mimeType": image.mime_type,
                    "data": STANDARD.encode(&image.bytes),
                })
            })
            .collect::<Vec<_>>()
            .into();
    }
    params
}
