//! WebSocket Push Adapter - Delivery to Remote Subscribers
//!
//! - `protocol`: JSON request/response types and request decoding
//! - `session`: per-connection subscriber state and forwarders
//! - `server`: axum `/ws` endpoint

pub mod protocol;
pub mod server;
pub mod session;

pub use server::{AppState, create_router};
pub use session::{PushSession, SessionError};
