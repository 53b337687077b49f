//! Market Feed Port - Upstream Feed Provider Interface
//!
//! The registry tells the provider which subscription keys are needed
//! across all subscribers; the provider keeps exactly one upstream feed
//! open per key and merges everything it receives into one broadcast
//! stream per data kind. Many subscriber views read each stream at once.

use std::collections::HashSet;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{
  BalanceEvent, DataKind, OpenOrdersEvent, OrderBookEvent, SubscriptionKey,
  TickerEvent, TradeEvent, TradeHistoryEvent,
};

/// An upstream feed that could not be opened or dropped with an error.
///
/// Travels on the merged stream of the key's data kind so that only the
/// views holding that key see it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("feed {key} failed: {reason}")]
pub struct FeedFailure {
  /// Key whose upstream failed.
  pub key: SubscriptionKey,
  /// Human-readable cause.
  pub reason: String,
}

/// One element of a merged stream.
pub type FeedItem<E> = Result<E, FeedFailure>;

/// Provider-side failures that are not tied to a single feed.
#[derive(Debug, Error)]
pub enum FeedError {
  /// The provider's feed table lock was poisoned by a panic.
  #[error("feed provider state lock poisoned")]
  Poisoned,
}

/// Trait for upstream feed providers.
///
/// `set_required_keys` is called with the registry's write lock held, so
/// implementations must not block or perform I/O there: open and close
/// connections on background tasks.
pub trait FeedProvider: Send + Sync + 'static {
  /// Replace the set of keys that need a live upstream feed.
  ///
  /// Idempotent: the same set twice in a row does nothing observable.
  /// A superset/subset opens/closes only the delta.
  fn set_required_keys(&self, keys: &HashSet<SubscriptionKey>) -> Result<(), FeedError>;

  /// Merged ticker stream across all open ticker feeds.
  fn tickers(&self) -> broadcast::Receiver<FeedItem<TickerEvent>>;

  /// Merged order book stream.
  fn order_books(&self) -> broadcast::Receiver<FeedItem<OrderBookEvent>>;

  /// Merged public trade stream.
  fn trades(&self) -> broadcast::Receiver<FeedItem<TradeEvent>>;

  /// Merged account trade history stream.
  fn user_trade_history(&self) -> broadcast::Receiver<FeedItem<TradeHistoryEvent>>;

  /// Merged account balance stream.
  fn balances(&self) -> broadcast::Receiver<FeedItem<BalanceEvent>>;

  /// Merged open orders stream.
  fn open_orders(&self) -> broadcast::Receiver<FeedItem<OpenOrdersEvent>>;
}

/// The six merged broadcast streams, one per data kind.
///
/// Cloning is cheap (senders only); connectors get a clone to publish
/// into and providers hand out receivers from it.
#[derive(Debug, Clone)]
pub struct FeedChannels {
  tickers: broadcast::Sender<FeedItem<TickerEvent>>,
  order_books: broadcast::Sender<FeedItem<OrderBookEvent>>,
  trades: broadcast::Sender<FeedItem<TradeEvent>>,
  user_trade_history: broadcast::Sender<FeedItem<TradeHistoryEvent>>,
  balances: broadcast::Sender<FeedItem<BalanceEvent>>,
  open_orders: broadcast::Sender<FeedItem<OpenOrdersEvent>>,
}

impl FeedChannels {
  /// Create all six channels with `capacity` slots each.
  ///
  /// A reader that falls more than `capacity` items behind skips ahead
  /// (`RecvError::Lagged`); publishers never block.
  pub fn new(capacity: usize) -> Self {
    Self {
      tickers: broadcast::channel(capacity).0,
      order_books: broadcast::channel(capacity).0,
      trades: broadcast::channel(capacity).0,
      user_trade_history: broadcast::channel(capacity).0,
      balances: broadcast::channel(capacity).0,
      open_orders: broadcast::channel(capacity).0,
    }
  }

  // Sends fail only when nobody is listening, which is not an error.

  pub fn publish_ticker(&self, event: TickerEvent) {
    let _ = self.tickers.send(Ok(event));
  }

  pub fn publish_order_book(&self, event: OrderBookEvent) {
    let _ = self.order_books.send(Ok(event));
  }

  pub fn publish_trade(&self, event: TradeEvent) {
    let _ = self.trades.send(Ok(event));
  }

  pub fn publish_user_trades(&self, event: TradeHistoryEvent) {
    let _ = self.user_trade_history.send(Ok(event));
  }

  pub fn publish_balance(&self, event: BalanceEvent) {
    let _ = self.balances.send(Ok(event));
  }

  pub fn publish_open_orders(&self, event: OpenOrdersEvent) {
    let _ = self.open_orders.send(Ok(event));
  }

  /// Publish a failure on the stream of the failed key's kind.
  pub fn publish_failure(&self, failure: FeedFailure) {
    let _ = match failure.key.kind {
      DataKind::Ticker => self.tickers.send(Err(failure)).is_ok(),
      DataKind::OrderBook => self.order_books.send(Err(failure)).is_ok(),
      DataKind::Trade => self.trades.send(Err(failure)).is_ok(),
      DataKind::UserTradeHistory => self.user_trade_history.send(Err(failure)).is_ok(),
      DataKind::Balance => self.balances.send(Err(failure)).is_ok(),
      DataKind::OpenOrders => self.open_orders.send(Err(failure)).is_ok(),
    };
  }

  pub fn subscribe_tickers(&self) -> broadcast::Receiver<FeedItem<TickerEvent>> {
    self.tickers.subscribe()
  }

  pub fn subscribe_order_books(&self) -> broadcast::Receiver<FeedItem<OrderBookEvent>> {
    self.order_books.subscribe()
  }

  pub fn subscribe_trades(&self) -> broadcast::Receiver<FeedItem<TradeEvent>> {
    self.trades.subscribe()
  }

  pub fn subscribe_user_trade_history(
    &self,
  ) -> broadcast::Receiver<FeedItem<TradeHistoryEvent>> {
    self.user_trade_history.subscribe()
  }

  pub fn subscribe_balances(&self) -> broadcast::Receiver<FeedItem<BalanceEvent>> {
    self.balances.subscribe()
  }

  pub fn subscribe_open_orders(&self) -> broadcast::Receiver<FeedItem<OpenOrdersEvent>> {
    self.open_orders.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use rust_decimal_macros::dec;

  use super::*;
  use crate::domain::{Ticker, TickerSpec};

  #[test]
  fn test_failure_routed_by_kind() {
    let channels = FeedChannels::new(8);
    let mut tickers = channels.subscribe_tickers();
    let mut trades = channels.subscribe_trades();

    let key = SubscriptionKey::new(TickerSpec::new("nowhere", "BTC", "USD"), DataKind::Trade);
    channels.publish_failure(FeedFailure {
      key: key.clone(),
      reason: "unknown exchange".to_string(),
    });

    assert!(tickers.try_recv().is_err());
    let failure = trades.try_recv().unwrap().unwrap_err();
    assert_eq!(failure.key, key);
    assert_eq!(failure.to_string(), "feed TRADE BTC/USD@nowhere failed: unknown exchange");
  }

  #[test]
  fn test_publish_without_readers_is_silent() {
    let channels = FeedChannels::new(2);
    channels.publish_ticker(TickerEvent {
      spec: TickerSpec::new("binance", "BTC", "USDT"),
      ticker: Ticker {
        bid: None,
        ask: None,
        last: dec!(1),
        volume: None,
        timestamp: Utc::now(),
      },
    });
    let mut late = channels.subscribe_tickers();
    assert!(late.try_recv().is_err());
  }
}
