//! Use Cases Layer - Subscription Multiplexing
//!
//! Orchestrates subscriber interest against the feed provider port.
//!
//! Use cases:
//! - `SubscriptionRegistry`: ref-counted key sets and provider notification
//! - `LiveView` / `ViewHandle`: per-subscriber filtered, latest-wins views
//! - `Watchlist`: config-driven background subscriber

pub mod live_view;
pub mod subscription_registry;
pub mod watchlist;

pub use live_view::{LiveView, ViewHandle};
pub use subscription_registry::{RegistryError, RegistryStats, SubscriptionRegistry};
pub use watchlist::{WATCHLIST_SUBSCRIBER, Watchlist};
