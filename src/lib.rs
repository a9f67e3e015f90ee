//! clawbridge: a backend-for-frontend bridge between browser webchat
//! clients and the OpenClaw gateway.
//!
//! Browsers speak HTTP and SSE against this process; the gateway speaks a
//! framed RPC protocol over WebSocket. The bridge multiplexes many browser
//! sessions onto a per-token pool of gateway connections, fans gateway
//! push events back out to subscribed browsers, and keeps no state on disk.

pub mod api;
pub mod chat;
pub mod config;
pub mod events;
pub mod gateway;
