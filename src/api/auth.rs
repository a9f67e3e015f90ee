//! Bearer-token middleware.
//!
//! Tokens are opaque: the bridge never validates them locally, it simply
//! forwards them to the gateway, which is the source of truth. The
//! middleware only requires that a well-formed `Authorization: Bearer`
//! header is present and makes the token available to handlers.

use axum::{
    extract::{FromRequestParts, Request},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;

/// The bearer token for the current request.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn bearer_token_from_header(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next().filter(|token| !token.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some(token)
}

fn extract_bearer(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token_from_header)
        .map(str::to_string)
        .ok_or_else(|| ApiError::unauthorized("missing or invalid bearer token"))
}

/// Require a bearer token and stash it in request extensions.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let token = extract_bearer(req.headers())?;
    req.extensions_mut().insert(BearerToken(token));
    Ok(next.run(req).await)
}

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<BearerToken>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("missing or invalid bearer token"))
    }
}
