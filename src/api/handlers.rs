//! JSON API handlers.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument};

use super::auth::BearerToken;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::chat::ImageAttachment;
use crate::chat::models::now_iso;

/// Upload limits: violations are client errors, not gateway errors.
pub const MAX_IMAGES: usize = 10;
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Success half of the `{ ok, data?, error? }` envelope.
pub fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "ok": true, "data": data }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: String,
}

/// Check a token against the gateway with a one-shot handshake. The token
/// travels in the body here; this is the one endpoint usable before the
/// browser has stored a credential.
#[instrument(skip(state, request))]
pub async fn verify_token(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<Json<Value>> {
    if request.token.trim().is_empty() {
        return Err(ApiError::bad_request("token must not be empty"));
    }
    let verified = state.pool.verify_token(&request.token).await?;
    if !verified {
        return Err(ApiError::InvalidToken);
    }
    Ok(envelope(json!({ "verified": true })))
}

#[instrument(skip(state, token))]
pub async fn list_sessions(
    State(state): State<AppState>,
    token: BearerToken,
) -> ApiResult<Json<Value>> {
    let sessions = state.sessions.list(token.as_str()).await?;
    Ok(envelope(sessions))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
}

#[instrument(skip(state, token, request))]
pub async fn create_session(
    State(state): State<AppState>,
    token: BearerToken,
    request: Option<Json<CreateSessionRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let session = state
        .sessions
        .create(token.as_str(), request.title.as_deref())
        .await?;
    info!(session_key = %session.key, "created session");
    Ok((StatusCode::CREATED, envelope(session)))
}

#[instrument(skip(state, token))]
pub async fn list_messages(
    State(state): State<AppState>,
    token: BearerToken,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    let messages = state.sessions.history(token.as_str(), &key).await?;
    Ok(envelope(messages))
}

/// Pull `text` and `images[]` out of a multipart message body, enforcing
/// the upload limits.
pub(super) async fn read_message_form(
    multipart: &mut Multipart,
) -> Result<(String, Vec<ImageAttachment>), ApiError> {
    let mut text = String::new();
    let mut images = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("text") => {
                text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("unreadable text field: {err}")))?;
            }
            Some("images") | Some("images[]") => {
                if images.len() >= MAX_IMAGES {
                    return Err(ApiError::bad_request(format!(
                        "too many images (limit {MAX_IMAGES})"
                    )));
                }
                let file_name = field.file_name().unwrap_or("image").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::bad_request(format!("unreadable image field: {err}"))
                })?;
                if bytes.len() > MAX_IMAGE_BYTES {
                    return Err(ApiError::bad_request(format!(
                        "image '{file_name}' exceeds the {} MB limit",
                        MAX_IMAGE_BYTES / (1024 * 1024)
                    )));
                }
                images.push(ImageAttachment {
                    name: file_name,
                    mime_type,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {
                // Unknown fields are drained and ignored.
                let _ = field.bytes().await;
            }
        }
    }

    if text.trim().is_empty() && images.is_empty() {
        return Err(ApiError::bad_request("message must carry text or images"));
    }

    Ok((text, images))
}

/// Blocking send: returns once the gateway has accepted (or completed)
/// delivery.
#[instrument(skip(state, token, multipart))]
pub async fn post_message(
    State(state): State<AppState>,
    token: BearerToken,
    Path(key): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (text, images) = read_message_form(&mut multipart).await?;
    state
        .sessions
        .send(token.as_str(), &key, &text, &images)
        .await?;
    Ok((StatusCode::CREATED, envelope(json!({ "accepted": true }))))
}

#[derive(Debug, Deserialize)]
pub struct PatchSessionRequest {
    pub archived: Option<bool>,
    pub title: Option<String>,
}

/// Rename and/or (un)archive a session. Either field alone is fine; the
/// response echoes what changed.
#[instrument(skip(state, token, request))]
pub async fn patch_session(
    State(state): State<AppState>,
    token: BearerToken,
    Path(key): Path<String>,
    Json(request): Json<PatchSessionRequest>,
) -> ApiResult<Json<Value>> {
    if request.archived.is_none() && request.title.is_none() {
        return Err(ApiError::bad_request(
            "at least one of 'archived' or 'title' is required",
        ));
    }

    if let Some(title) = &request.title {
        state.sessions.rename(token.as_str(), &key, title).await?;
    }
    if let Some(archived) = request.archived {
        if archived {
            state.sessions.archive(token.as_str(), &key);
        } else {
            state.sessions.unarchive(token.as_str(), &key);
        }
    }

    let mut merged = json!({ "sessionKey": key });
    if let Some(archived) = request.archived {
        merged["archived"] = json!(archived);
    }
    if let Some(title) = request.title {
        merged["title"] = json!(title);
    }
    Ok(envelope(merged))
}

#[instrument(skip(state, token))]
pub async fn delete_session(
    State(state): State<AppState>,
    token: BearerToken,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    state.sessions.close(token.as_str(), &key).await?;
    info!(session_key = %key, "closed session");
    Ok(envelope(json!({ "closed": true, "sessionKey": key })))
}

/// Liveness endpoint; no auth and no gateway round-trip.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "service": "clawbridge",
        "gateway": state.config.gateway_ws_url,
        "timestamp": now_iso(),
    }))
}
