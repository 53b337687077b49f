//! Push session - one connection's subscriber state.
//!
//! A session owns a subscriber id for the connection's lifetime. Each
//! `CHANGE_SUBSCRIPTIONS` request replaces its key set in the registry and
//! rebuilds one forwarder per data kind, which copies the kind's filtered
//! view into the connection's outbound queue. Closing the session clears
//! its keys so no upstream feed outlives the connection.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{self, Command, DecodeError, Outbound};
use crate::domain::{DataKind, MarketEvent, SubscriberId, SubscriptionKey};
use crate::usecases::{LiveView, RegistryError, SubscriptionRegistry};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("subscription change failed: {source}")]
    Registry {
        correlation_id: Option<String>,
        #[source]
        source: RegistryError,
    },
}

impl SessionError {
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Decode(e) => e.correlation_id(),
            Self::Registry { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}

pub struct PushSession {
    id: SubscriberId,
    registry: Arc<SubscriptionRegistry>,
    outbound: mpsc::Sender<Outbound>,
    /// One task per data kind in the current key set.
    forwarders: Vec<JoinHandle<()>>,
    closed: bool,
}

impl PushSession {
    /// Start a session with a fresh subscriber id.
    pub fn new(registry: Arc<SubscriptionRegistry>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            registry,
            outbound,
            forwarders: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one inbound text frame.
    ///
    /// Returns the ERROR reply to send when the request failed; the
    /// connection stays usable either way.
    pub fn handle_text(&mut self, text: &str) -> Option<Outbound> {
        match self.handle(text) {
            Ok(()) => None,
            Err(e) => {
                match &e {
                    SessionError::Registry {
                        source: RegistryError::Poisoned,
                        ..
                    } => error!(subscriber = %self.id, error = %e, "Registry unusable"),
                    _ => warn!(subscriber = %self.id, error = %e, message = text, "Error processing message"),
                }
                Some(Outbound::error(e.correlation_id().map(str::to_string)))
            }
        }
    }

    fn handle(&mut self, text: &str) -> Result<(), SessionError> {
        let request = protocol::decode(text)?;
        match request.command {
            Command::ChangeSubscriptions => {
                let keys: HashSet<SubscriptionKey> = request.keys.into_iter().collect();
                self.change_subscriptions(keys).map_err(|source| SessionError::Registry {
                    correlation_id: request.correlation_id,
                    source,
                })
            }
        }
    }

    /// Apply `keys`, then rebuild forwarders from whatever the registry
    /// now holds for this session, even when the change reported an error.
    fn change_subscriptions(&mut self, keys: HashSet<SubscriptionKey>) -> Result<(), RegistryError> {
        debug!(subscriber = %self.id, keys = keys.len(), "Changing subscriptions");

        let changed = self.registry.change_subscriptions(&self.id, keys);
        self.stop_forwarders();
        let rebuilt = self.rebuild_forwarders();
        changed?;
        rebuilt?;

        info!(subscriber = %self.id, forwarders = self.forwarders.len(), "Subscriptions changed");
        Ok(())
    }

    /// One forwarder per data kind the session holds. Keeps going past a
    /// kind whose view fails and returns the first error.
    fn rebuild_forwarders(&mut self) -> Result<(), RegistryError> {
        let held = self.registry.subscriptions_of(&self.id)?;
        let kinds: BTreeSet<DataKind> = held.iter().map(|key| key.kind).collect();

        let mut first_error = None;
        for kind in kinds {
            match self.registry.events(&self.id, kind) {
                Ok(view) => {
                    let outbound = self.outbound.clone();
                    self.forwarders.push(tokio::spawn(forward(view, outbound)));
                }
                Err(e) => {
                    warn!(subscriber = %self.id, %kind, error = %e, "Failed to build forwarder");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn stop_forwarders(&mut self) {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }

    /// Stop forwarding and clear the subscriber's keys. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop_forwarders();
        if let Err(e) = self.registry.change_subscriptions(&self.id, HashSet::new()) {
            error!(subscriber = %self.id, error = %e, "Failed to clear subscriptions on close");
        }
    }
}

impl Drop for PushSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy `view` into `outbound` until either side ends.
async fn forward(mut view: LiveView<MarketEvent>, outbound: mpsc::Sender<Outbound>) {
    while let Some(item) = view.next().await {
        let message = match item {
            Ok(event) => match Outbound::event(&event) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, kind = %event.kind(), "Failed to encode event");
                    continue;
                }
            },
            Err(failure) => Outbound::feed_failure(&failure),
        };
        if outbound.send(message).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast;

    use super::*;
    use crate::adapters::feeds::{ConnectorRegistry, StreamingFeedHub};
    use crate::adapters::ws::protocol::{Nature, PROCESSING_ERROR};
    use crate::domain::{
        BalanceEvent, OpenOrdersEvent, OrderBookEvent, Ticker, TickerEvent, TickerSpec, Trade,
        TradeEvent, TradeHistoryEvent, TradeSide,
    };
    use crate::ports::exchange::ExchangeConnector;
    use crate::ports::market_feed::{FeedChannels, FeedError, FeedFailure, FeedItem, FeedProvider};

    /// Connector that holds the feed open without producing anything.
    struct Idle;

    #[async_trait]
    impl ExchangeConnector for Idle {
        fn exchange(&self) -> &'static str {
            "sim"
        }

        fn supports(&self, _kind: DataKind) -> bool {
            true
        }

        async fn stream(&self, _key: &SubscriptionKey, _sink: &FeedChannels) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    fn setup() -> (Arc<StreamingFeedHub>, Arc<SubscriptionRegistry>) {
        let mut connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(Idle));
        let hub = Arc::new(StreamingFeedHub::with_runtime(
            connectors,
            32,
            Duration::from_secs(60),
            tokio::runtime::Handle::current(),
        ));
        let registry = Arc::new(SubscriptionRegistry::new(hub.clone()));
        (hub, registry)
    }

    /// Provider whose notifications fail once `failing` is set.
    struct Flaky {
        channels: FeedChannels,
        failing: AtomicBool,
    }

    impl FeedProvider for Flaky {
        fn set_required_keys(&self, _keys: &HashSet<SubscriptionKey>) -> Result<(), FeedError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(FeedError::Poisoned);
            }
            Ok(())
        }

        fn tickers(&self) -> broadcast::Receiver<FeedItem<TickerEvent>> {
            self.channels.subscribe_tickers()
        }

        fn order_books(&self) -> broadcast::Receiver<FeedItem<OrderBookEvent>> {
            self.channels.subscribe_order_books()
        }

        fn trades(&self) -> broadcast::Receiver<FeedItem<TradeEvent>> {
            self.channels.subscribe_trades()
        }

        fn user_trade_history(&self) -> broadcast::Receiver<FeedItem<TradeHistoryEvent>> {
            self.channels.subscribe_user_trade_history()
        }

        fn balances(&self) -> broadcast::Receiver<FeedItem<BalanceEvent>> {
            self.channels.subscribe_balances()
        }

        fn open_orders(&self) -> broadcast::Receiver<FeedItem<OpenOrdersEvent>> {
            self.channels.subscribe_open_orders()
        }
    }

    const BTC_TICKER: &str = r#"{"command":"CHANGE_SUBSCRIPTIONS","correlationId":"c1","keys":[{"exchange":"sim","base":"BTC","counter":"USD","kind":"TICKER"}]}"#;

    #[tokio::test]
    async fn test_change_registers_keys() {
        let (_hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let mut session = PushSession::new(Arc::clone(&registry), tx);

        assert!(session.handle_text(BTC_TICKER).is_none());

        let key = SubscriptionKey::ticker(TickerSpec::new("sim", "BTC", "USD"));
        assert_eq!(registry.ref_count(&key).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_request_replies_error() {
        let (_hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let mut session = PushSession::new(registry, tx);

        let reply = session
            .handle_text(r#"{"command":"NOPE","correlationId":"c9"}"#)
            .unwrap();
        assert_eq!(reply.nature, Nature::Error);
        assert_eq!(reply.correlation_id.as_deref(), Some("c9"));
        assert_eq!(reply.data, PROCESSING_ERROR);
    }

    #[tokio::test]
    async fn test_feed_failure_forwarded_as_error() {
        let (hub, registry) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = PushSession::new(registry, tx);
        session.handle_text(BTC_TICKER);

        let key = SubscriptionKey::ticker(TickerSpec::new("sim", "BTC", "USD"));
        hub.channels().publish_failure(FeedFailure {
            key,
            reason: "down".to_string(),
        });

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.nature, Nature::Error);
        assert!(message.data.as_str().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_drop_clears_subscriptions() {
        let (hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let mut session = PushSession::new(Arc::clone(&registry), tx);
        session.handle_text(BTC_TICKER);
        assert_eq!(hub.stats().unwrap().active_feeds, 1);

        drop(session);

        assert!(registry.required_keys().unwrap().is_empty());
        assert_eq!(hub.stats().unwrap().active_feeds, 0);
    }

    #[tokio::test]
    async fn test_forwarders_follow_committed_keys_after_provider_error() {
        let provider = Arc::new(Flaky {
            channels: FeedChannels::new(16),
            failing: AtomicBool::new(false),
        });
        let registry = Arc::new(SubscriptionRegistry::new(provider.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = PushSession::new(Arc::clone(&registry), tx);
        assert!(session.handle_text(BTC_TICKER).is_none());

        provider.failing.store(true, Ordering::SeqCst);
        let reply = session
            .handle_text(
                r#"{"command":"CHANGE_SUBSCRIPTIONS","correlationId":"c2","keys":[{"exchange":"sim","base":"ETH","counter":"USD","kind":"TRADE"}]}"#,
            )
            .unwrap();
        assert_eq!(reply.nature, Nature::Error);
        assert_eq!(reply.correlation_id.as_deref(), Some("c2"));

        let eth_trade = SubscriptionKey::new(TickerSpec::new("sim", "ETH", "USD"), DataKind::Trade);
        assert_eq!(
            registry.subscriptions_of(session.id()).unwrap(),
            HashSet::from([eth_trade])
        );

        // The superseded ticker forwarder is gone.
        provider.channels.publish_ticker(TickerEvent {
            spec: TickerSpec::new("sim", "BTC", "USD"),
            ticker: Ticker {
                bid: None,
                ask: None,
                last: dec!(1),
                volume: None,
                timestamp: Utc::now(),
            },
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        provider.channels.publish_trade(TradeEvent {
            spec: TickerSpec::new("sim", "ETH", "USD"),
            trade: Trade {
                id: "t1".to_string(),
                side: TradeSide::Buy,
                price: dec!(2),
                amount: dec!(3),
                timestamp: Utc::now(),
            },
        });

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.nature, Nature::Trade);
        assert_eq!(message.data["spec"]["base"], "ETH");
    }
}
