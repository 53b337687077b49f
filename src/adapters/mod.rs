//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (exchange WebSockets, HTTP servers).
//!
//! Adapter categories:
//! - `feeds`: upstream exchange connectors and the feed hub
//! - `metrics`: Prometheus metrics export and health checks
//! - `ws`: WebSocket push delivery to remote subscribers

pub mod feeds;
pub mod metrics;
pub mod ws;
