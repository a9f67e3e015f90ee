//! HTTP/SSE surface: auth middleware, JSON endpoints, SSE channels.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod sse;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
