//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::gateway::GatewayError;

/// API error type with structured responses.
///
/// The `code` strings are part of the browser contract: the UI treats
/// `UNAUTHORIZED` as session expiry and `INVALID_TOKEN` as a failed fresh
/// login, so these are emitted consistently and never as synonyms.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gateway connection failed: {0}")]
    GatewayConnectFailed(String),

    #[error("Gateway RPC error: {0}")]
    GatewayRpc(String, Option<Value>),

    #[error("Streaming is disabled")]
    StreamingDisabled,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::GatewayConnectFailed(_) | Self::GatewayRpc(..) => StatusCode::BAD_GATEWAY,
            Self::StreamingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::GatewayConnectFailed(_) => "GATEWAY_CONNECT_FAILED",
            Self::GatewayRpc(..) => "GATEWAY_RPC_ERROR",
            Self::StreamingDisabled => "STREAMING_DISABLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error half of the `{ ok, data?, error? }` envelope.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    ok: bool,
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::GatewayConnectFailed(msg) | ApiError::GatewayRpc(msg, _) => {
                warn!(error_code = code, message = %msg, "Gateway error");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        let details = match &self {
            ApiError::GatewayRpc(_, details) => details.clone(),
            _ => None,
        };

        let body = ErrorEnvelope {
            ok: false,
            error: ErrorBody {
                code,
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Classify gateway errors once, by code. `NOT_FOUND` details on an RPC
/// error surface as HTTP 404 so session/message lookups behave.
impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized(msg) => ApiError::Unauthorized(msg),
            GatewayError::ConnectFailed(msg) => ApiError::GatewayConnectFailed(msg),
            GatewayError::Rpc {
                code,
                message,
                data,
            } => {
                if code.eq_ignore_ascii_case("NOT_FOUND") {
                    ApiError::NotFound(message)
                } else {
                    ApiError::GatewayRpc(message, data)
                }
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::unauthorized("").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::InvalidToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::bad_request("").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::GatewayConnectFailed("".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::GatewayRpc("".into(), None).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::StreamingDisabled.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::internal("").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_gateway_error_classification() {
        let err: ApiError = GatewayError::Unauthorized("expired".into()).into();
        assert_eq!(err.error_code(), "UNAUTHORIZED");

        let err: ApiError = GatewayError::ConnectFailed("refused".into()).into();
        assert_eq!(err.error_code(), "GATEWAY_CONNECT_FAILED");

        let err: ApiError = GatewayError::rpc("NOT_FOUND", "no such session").into();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err: ApiError = GatewayError::rpc("TIMEOUT", "too slow").into();
        assert_eq!(err.error_code(), "GATEWAY_RPC_ERROR");
    }
}
