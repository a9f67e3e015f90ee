//! Gateway WebSocket RPC client, wire protocol and connection pool.

pub mod client;
pub mod error;
pub mod pool;
pub mod protocol;

pub use client::{EventCallback, EventSubscription, RpcClient, RpcClientOptions};
pub use error::{GatewayError, GatewayResult};
pub use pool::{ConnectionPool, DefaultConnector, GatewayConnector};
pub use protocol::{EventFrame, Frame, ResponseFrame};
