//! Application state shared across handlers.

use std::sync::Arc;

use crate::chat::SessionManager;
use crate::config::BridgeConfig;
use crate::events::EventForwarder;
use crate::gateway::{ConnectionPool, DefaultConnector, GatewayConnector};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub pool: Arc<ConnectionPool>,
    pub sessions: Arc<SessionManager>,
    pub forwarder: Arc<EventForwarder>,
}

impl AppState {
    /// Wire up the pool, session manager and forwarder from config.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    /// Same, with a custom connector (tests instrument construction).
    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn GatewayConnector>) -> Self {
        let config = Arc::new(config);
        let pool = Arc::new(ConnectionPool::new(config.client_options(""), connector));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&pool)));
        let forwarder = Arc::new(EventForwarder::new(Arc::clone(&pool)));
        Self {
            config,
            pool,
            sessions,
            forwarder,
        }
    }

    /// Replace the forwarder (tests compress its timer cadences).
    pub fn with_forwarder(mut self, forwarder: EventForwarder) -> Self {
        self.forwarder = Arc::new(forwarder);
        self
    }
}
