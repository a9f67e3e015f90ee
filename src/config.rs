//! Bridge configuration.
//!
//! Settings come from an optional TOML file layered under environment
//! variables; the environment wins. Variable names map directly onto the
//! field names (`GATEWAY_WS_URL` → `gateway_ws_url`, and so on).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::RpcClientOptions;
use crate::gateway::protocol::DEFAULT_CLIENT_ID;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upstream gateway WebSocket endpoint (ws:// or wss://).
    pub gateway_ws_url: String,
    /// Origin header for the WS upgrade; empty uses the library default.
    pub gateway_ws_origin: String,
    /// Bounds WS upgrade plus connect handshake.
    pub gateway_connect_timeout_ms: u64,
    /// Bounds each RPC.
    pub gateway_request_timeout_ms: u64,
    /// WebSocket ping cadence; 0 disables.
    pub gateway_heartbeat_interval_ms: u64,
    /// Linear-backoff reconnect attempts for standalone clients.
    pub gateway_reconnect_max_retries: u32,
    pub gateway_reconnect_delay_ms: u64,
    /// When false, TLS verification is disabled for the whole outbound WS
    /// stack. Development only.
    pub tls_verify: bool,
    /// When false, `POST .../messages/stream` answers 503.
    pub streaming_enabled: bool,
    /// Comma-separated CORS origins; empty allows any origin.
    pub cors_origins: String,
    pub api_port: u16,
    /// Connect handshake client descriptor.
    pub gateway_client_id: String,
    pub gateway_client_instance_id: String,
    pub gateway_client_version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gateway_ws_url: "ws://127.0.0.1:18789".to_string(),
            gateway_ws_origin: String::new(),
            gateway_connect_timeout_ms: 10_000,
            gateway_request_timeout_ms: 30_000,
            gateway_heartbeat_interval_ms: 15_000,
            gateway_reconnect_max_retries: 3,
            gateway_reconnect_delay_ms: 1_500,
            tls_verify: true,
            streaming_enabled: true,
            cors_origins: String::new(),
            api_port: 8787,
            gateway_client_id: DEFAULT_CLIENT_ID.to_string(),
            gateway_client_instance_id: format!("web-{}", Uuid::new_v4()),
            gateway_client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration: optional file, then environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        let path = match file {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_config_path(),
        };
        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(
                    File::from(path.as_path()).format(FileFormat::Toml),
                );
            } else if file.is_some() {
                anyhow::bail!("config file not found: {}", path.display());
            }
        }
        builder = builder.add_source(Environment::default().try_parsing(true));
        builder
            .build()
            .context("assembling configuration")?
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Conventional config file location.
    pub fn default_config_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("clawbridge").join("config.toml"))
    }

    /// Parsed CORS origin list.
    pub fn origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Client options for a standalone connection with this token. The
    /// pool adapts these for pooled use.
    pub fn client_options(&self, token: &str) -> RpcClientOptions {
        RpcClientOptions {
            url: self.gateway_ws_url.clone(),
            token: token.to_string(),
            origin: if self.gateway_ws_origin.is_empty() {
                None
            } else {
                Some(self.gateway_ws_origin.clone())
            },
            connect_timeout: Duration::from_millis(self.gateway_connect_timeout_ms),
            request_timeout: Duration::from_millis(self.gateway_request_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.gateway_heartbeat_interval_ms),
            reconnect_max_retries: self.gateway_reconnect_max_retries,
            reconnect_delay: Duration::from_millis(self.gateway_reconnect_delay_ms),
            tls_verify: self.tls_verify,
            client_id: self.gateway_client_id.clone(),
            client_version: self.gateway_client_version.clone(),
            client_instance_id: self.gateway_client_instance_id.clone(),
        }
    }
}
