//! Exchange Connector Port - Per-Key Upstream Connections
//!
//! A connector knows how to stream one subscription key from one
//! exchange. The feed hub owns the lifecycle: it calls `stream` on a
//! background task when a key becomes required, restarts it after
//! failures, and aborts it when the key is no longer needed.

use async_trait::async_trait;

use super::market_feed::FeedChannels;
use crate::domain::{DataKind, SubscriptionKey};

/// Trait for exchange connectivity adapters.
#[async_trait]
pub trait ExchangeConnector: Send + Sync + 'static {
  /// Exchange identifier this connector serves (e.g., "binance").
  fn exchange(&self) -> &'static str;

  /// Whether the connector can provide feeds of `kind`.
  fn supports(&self, kind: DataKind) -> bool;

  /// Stream `key` into `sink` until the connection ends.
  ///
  /// `Ok(())` means the upstream closed cleanly; the hub reopens it
  /// after its reconnect delay either way.
  async fn stream(&self, key: &SubscriptionKey, sink: &FeedChannels) -> anyhow::Result<()>;
}
