//! Gateway client error types.

use serde_json::Value;
use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while talking to the gateway.
///
/// The taxonomy is deliberately small: authentication failures, failures to
/// establish or keep a usable connection, and failures of individual RPC
/// requests on an otherwise healthy connection. The HTTP layer classifies
/// these once, by code, into response statuses.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The gateway rejected the credentials, either during the WebSocket
    /// upgrade, the connect handshake, or a per-request response.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// TCP/TLS/upgrade failure, handshake failure for non-auth reasons, or a
    /// request attempted while the connection is not ready.
    #[error("gateway connection failed: {0}")]
    ConnectFailed(String),

    /// The handshake succeeded but a specific RPC request failed.
    #[error("gateway rpc error: {message} (code: {code})")]
    Rpc {
        code: String,
        message: String,
        data: Option<Value>,
    },
}

impl GatewayError {
    /// Stable error code string, matching the wire contract with browsers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::ConnectFailed(_) => "GATEWAY_CONNECT_FAILED",
            Self::Rpc { .. } => "GATEWAY_RPC_ERROR",
        }
    }

    pub fn rpc(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// The upstream error code carried by an RPC failure, if any.
    pub fn upstream_code(&self) -> Option<&str> {
        match self {
            Self::Rpc { code, .. } => Some(code),
            _ => None,
        }
    }
}
