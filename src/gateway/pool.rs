//! Token-keyed pool of gateway connections.
//!
//! Each bearer token gets at most one live `RpcClient`. Entries are stored
//! before their handshake is awaited, so concurrent callers for the same
//! token coordinate through the shared handshake future instead of racing
//! to open sockets. Entries are invalidated when the TTL lapses, the
//! socket drops, or the handshake fails; the next caller lazily rebuilds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::{debug, info};

use super::client::{RpcClient, RpcClientOptions};
use super::error::{GatewayError, GatewayResult};

/// How long a pooled connection may be reused before it is rebuilt.
const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

type SharedHandshake = Shared<BoxFuture<'static, GatewayResult<()>>>;

/// Construction seam for clients, so tests can count or wrap what the pool
/// builds.
pub trait GatewayConnector: Send + Sync {
    fn build(&self, opts: RpcClientOptions) -> Arc<RpcClient>;
}

/// Builds plain `RpcClient`s.
pub struct DefaultConnector;

impl GatewayConnector for DefaultConnector {
    fn build(&self, opts: RpcClientOptions) -> Arc<RpcClient> {
        Arc::new(RpcClient::new(opts))
    }
}

struct PoolEntry {
    client: Arc<RpcClient>,
    created_at: Instant,
    handshake: SharedHandshake,
}

/// Pool of gateway connections keyed by bearer token.
pub struct ConnectionPool {
    /// Options template; the token is filled in per entry.
    base: RpcClientOptions,
    connector: Arc<dyn GatewayConnector>,
    entries: DashMap<String, PoolEntry>,
    ttl: Duration,
}

impl ConnectionPool {
    pub fn new(base: RpcClientOptions, connector: Arc<dyn GatewayConnector>) -> Self {
        Self {
            base,
            connector,
            entries: DashMap::new(),
            ttl: DEFAULT_TTL,
        }
    }

    /// Override the entry TTL (tests compress this).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Options for a pooled connection: the pool owns recovery, so
    /// client-level reconnect is disabled and stale entries are rebuilt on
    /// demand instead.
    fn pooled_options(&self, token: &str) -> RpcClientOptions {
        let mut opts = self.base.clone();
        opts.token = token.to_string();
        opts.reconnect_max_retries = 0;
        opts
    }

    /// Get the live connection for a token, building and handshaking one if
    /// needed. Callers arriving while a handshake is in flight await that
    /// same handshake; no token ever has two clients being built at once.
    pub async fn get_connection(&self, token: &str) -> GatewayResult<Arc<RpcClient>> {
        loop {
            if let Some(entry) = self.entries.get(token) {
                let client = Arc::clone(&entry.client);
                let handshake = entry.handshake.clone();
                let created_at = entry.created_at;
                let fresh = created_at.elapsed() < self.ttl;
                drop(entry);

                if !fresh {
                    debug!("pooled gateway connection expired, rebuilding");
                    self.entries
                        .remove_if(token, |_, e| e.created_at == created_at);
                    client.close();
                    continue;
                }

                match handshake.await {
                    Ok(()) if client.is_connected() => return Ok(client),
                    _ => {
                        self.entries
                            .remove_if(token, |_, e| e.created_at == created_at);
                        continue;
                    }
                }
            }

            let (client, handshake) = match self.entries.entry(token.to_string()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let client = self.connector.build(self.pooled_options(token));
                    let connecting = Arc::clone(&client);
                    let handshake: SharedHandshake =
                        async move { connecting.connect().await }.boxed().shared();
                    vacant.insert(PoolEntry {
                        client: Arc::clone(&client),
                        created_at: Instant::now(),
                        handshake: handshake.clone(),
                    });
                    (client, handshake)
                }
            };

            return match handshake.await {
                Ok(()) => Ok(client),
                Err(err) => {
                    self.entries
                        .remove_if(token, |_, e| Arc::ptr_eq(&e.client, &client));
                    Err(err)
                }
            };
        }
    }

    /// Check a token by running a one-shot connect handshake outside the
    /// pool. Returns false exactly when the gateway rejected the token.
    pub async fn verify_token(&self, token: &str) -> GatewayResult<bool> {
        let mut opts = self.pooled_options(token);
        opts.heartbeat_interval = Duration::ZERO;
        let client = self.connector.build(opts);
        let result = client.connect().await;
        client.close();
        match result {
            Ok(()) => Ok(true),
            Err(GatewayError::Unauthorized(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drop a token's connection. In-flight requests on it reject with a
    /// connection failure; the next caller re-handshakes.
    pub fn close_token(&self, token: &str) {
        if let Some((_, entry)) = self.entries.remove(token) {
            entry.client.close();
            info!("closed pooled gateway connection");
        }
    }

    /// Drop every pooled connection.
    pub fn close_all(&self) {
        let tokens: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for token in tokens {
            self.close_token(&token);
        }
    }

    /// Number of live entries (observability and tests).
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
