//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the registry and use cases
//! require from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `MarketFeed`: Upstream feed provider (required keys in, merged streams out)
//! - `Exchange`: Per-key exchange connectivity driven by the feed hub

pub mod exchange;
pub mod market_feed;

