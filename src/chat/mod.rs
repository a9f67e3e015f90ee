//! Chat sessions, messages and streaming send.

pub mod models;
pub mod service;
pub mod stream;

pub use models::{ChatMessage, ImageAttachment, Role, Session};
pub use service::SessionManager;
pub use stream::{MessageStream, StreamEvent};
