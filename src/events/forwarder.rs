//! Persistent push-event fan-out.
//!
//! Browsers hold one long-lived SSE channel per token; the forwarder holds
//! one wildcard event listener per token on the pooled gateway connection
//! and broadcasts translated events to every subscriber. A periodic health
//! check notices dropped gateway sockets and silently re-attaches, so
//! browsers never have to reconnect for a gateway blip; keepalives flow on
//! their own timer regardless of upstream activity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc;

use super::translate::{PushEvent, translate_frame};
use crate::gateway::{ConnectionPool, EventSubscription, GatewayResult, RpcClient};

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<PushEvent>,
}

struct TokenEntry {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    /// Distinguishes this entry from a re-created one so a maintenance
    /// task never services an entry it does not own.
    epoch: u64,
    subscription: Option<EventSubscription>,
    client: Option<Arc<RpcClient>>,
}

struct ForwarderInner {
    pool: Arc<ConnectionPool>,
    entries: DashMap<String, TokenEntry>,
    epoch_counter: AtomicU64,
    health_interval: Duration,
    keepalive_interval: Duration,
}

/// Fan-out of gateway push events to per-token SSE subscribers.
pub struct EventForwarder {
    inner: Arc<ForwarderInner>,
}

impl EventForwarder {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_intervals(pool, DEFAULT_HEALTH_INTERVAL, DEFAULT_KEEPALIVE_INTERVAL)
    }

    /// Constructor with explicit cadences (tests compress these).
    pub fn with_intervals(
        pool: Arc<ConnectionPool>,
        health_interval: Duration,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                pool,
                entries: DashMap::new(),
                epoch_counter: AtomicU64::new(0),
                health_interval,
                keepalive_interval,
            }),
        }
    }

    /// Register a subscriber. The first subscriber for a token starts the
    /// maintenance task, which attaches the gateway listener; if that
    /// attach fails the subscription still stands (keepalives only) and
    /// attachment keeps being retried.
    pub fn subscribe(&self, token: &str) -> (u64, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut started_epoch = None;
        let id = {
            let mut entry = self.inner.entries.entry(token.to_string()).or_insert_with(|| {
                let epoch = self.inner.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
                started_epoch = Some(epoch);
                TokenEntry {
                    subscribers: Vec::new(),
                    next_id: 0,
                    epoch,
                    subscription: None,
                    client: None,
                }
            });
            let id = entry.next_id;
            entry.next_id += 1;
            entry.subscribers.push(Subscriber { id, tx });
            id
        };

        if let Some(epoch) = started_epoch {
            info!("first push subscriber for token, starting forwarder entry");
            let inner = Arc::clone(&self.inner);
            let token = token.to_string();
            tokio::spawn(inner.maintain(token, epoch));
        }

        (id, rx)
    }

    /// Remove a subscriber. The last one leaving releases the gateway
    /// listener and the entry itself.
    pub fn unsubscribe(&self, token: &str, id: u64) {
        let empty = match self.inner.entries.get_mut(token) {
            None => false,
            Some(mut entry) => {
                entry.subscribers.retain(|s| s.id != id);
                entry.subscribers.is_empty()
            }
        };
        if empty {
            self.inner
                .entries
                .remove_if(token, |_, entry| entry.subscribers.is_empty());
            debug!("last push subscriber left, entry released");
        }
    }

    /// Number of tokens currently being forwarded (observability, tests).
    pub fn active_tokens(&self) -> usize {
        self.inner.entries.len()
    }
}

impl ForwarderInner {
    /// Health-check and keepalive loop for one token entry. Exits when the
    /// entry is gone or has been replaced by a newer epoch.
    async fn maintain(self: Arc<Self>, token: String, epoch: u64) {
        let mut health = tokio::time::interval(self.health_interval);
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );

        loop {
            tokio::select! {
                _ = health.tick() => {
                    let needs_attach = match self.entries.get_mut(&token) {
                        None => return,
                        Some(mut entry) => {
                            if entry.epoch != epoch {
                                return;
                            }
                            match &entry.client {
                                Some(client) if client.is_connected() => false,
                                _ => {
                                    entry.subscription = None;
                                    entry.client = None;
                                    true
                                }
                            }
                        }
                    };
                    if needs_attach {
                        if let Err(err) = Self::ensure_listener(&self, &token, epoch).await {
                            debug!("gateway listener attach failed: {err}; retrying on next tick");
                        }
                    }
                }
                _ = keepalive.tick() => {
                    let event = PushEvent::Keepalive { ts: Utc::now().timestamp_millis() };
                    if !self.broadcast(&token, epoch, event) {
                        return;
                    }
                }
            }
        }
    }

    /// Attach the wildcard listener over the token's pooled connection.
    async fn ensure_listener(this: &Arc<Self>, token: &str, epoch: u64) -> GatewayResult<()> {
        let client = this.pool.get_connection(token).await?;

        let inner = Arc::clone(this);
        let owner = token.to_string();
        let subscription = client.subscribe_event("*", move |frame| {
            if let Some(event) = translate_frame(&frame.event, &frame.payload) {
                if let Some(mut entry) = inner.entries.get_mut(&owner) {
                    // Best-effort, at-most-once: a failed write drops that
                    // subscriber and nobody else.
                    entry.subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
                }
            }
        });

        match this.entries.get_mut(token) {
            Some(mut entry) if entry.epoch == epoch => {
                entry.subscription = Some(subscription);
                entry.client = Some(client);
                info!("gateway push listener attached");
                Ok(())
            }
            // Every subscriber left while we were attaching.
            _ => Ok(()),
        }
    }

    /// Returns false when the entry no longer exists (or was replaced).
    fn broadcast(&self, token: &str, epoch: u64, event: PushEvent) -> bool {
        match self.entries.get_mut(token) {
            Some(mut entry) if entry.epoch == epoch => {
                entry.subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
                true
            }
            _ => false,
        }
    }
}
