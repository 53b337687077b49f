//! Streaming Feed Hub - One Supervised Upstream Task per Required Key
//!
//! Implements `FeedProvider`. Each required key gets a background task
//! that runs the exchange connector for it, publishes a `FeedFailure`
//! when the connector errors or cannot serve the key, waits the reconnect
//! delay and tries again. Keys dropped from the required set have their
//! task aborted. Everything a connector receives lands on the hub's six
//! merged broadcast channels.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::connectors::ConnectorRegistry;
use crate::config::FeedsConfig;
use crate::domain::{
    BalanceEvent, OpenOrdersEvent, OrderBookEvent, SubscriptionKey, TickerEvent, TradeEvent,
    TradeHistoryEvent,
};
use crate::ports::exchange::ExchangeConnector;
use crate::ports::market_feed::{FeedChannels, FeedError, FeedFailure, FeedItem, FeedProvider};

/// Counters shared with the supervise tasks.
#[derive(Debug, Default)]
struct HubCounters {
    /// Upstream failures, including unknown exchanges and unsupported kinds.
    failures: AtomicU64,
    /// Connector runs started.
    attempts: AtomicU64,
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Keys with a supervise task.
    pub active_feeds: usize,
    pub failures: u64,
    pub attempts: u64,
}

/// Feed provider backed by exchange connectors.
pub struct StreamingFeedHub {
    /// Merged streams shared by every view.
    channels: FeedChannels,
    /// Available exchange connectors.
    connectors: ConnectorRegistry,
    /// One supervise task per required key.
    feeds: Mutex<HashMap<SubscriptionKey, JoinHandle<()>>>,
    /// Runtime the supervise tasks are spawned on.
    runtime: Handle,
    /// Wait between connector runs.
    reconnect_delay: Duration,
    counters: Arc<HubCounters>,
}

impl StreamingFeedHub {
    /// Create a hub on the current Tokio runtime.
    pub fn new(connectors: ConnectorRegistry, config: &FeedsConfig) -> Result<Self> {
        let runtime = Handle::try_current().context("Feed hub needs a Tokio runtime")?;
        Ok(Self::with_runtime(
            connectors,
            config.channel_capacity,
            Duration::from_millis(config.reconnect_delay_ms),
            runtime,
        ))
    }

    pub fn with_runtime(
        connectors: ConnectorRegistry,
        capacity: usize,
        reconnect_delay: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            channels: FeedChannels::new(capacity),
            connectors,
            feeds: Mutex::new(HashMap::new()),
            runtime,
            reconnect_delay,
            counters: Arc::new(HubCounters::default()),
        }
    }

    /// The merged channels; connectors and tests publish here.
    pub const fn channels(&self) -> &FeedChannels {
        &self.channels
    }

    /// Keys that currently have an upstream task.
    pub fn active_keys(&self) -> Result<HashSet<SubscriptionKey>, FeedError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    pub fn stats(&self) -> Result<HubStats, FeedError> {
        Ok(HubStats {
            active_feeds: self.lock()?.len(),
            failures: self.counters.failures.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SubscriptionKey, JoinHandle<()>>>, FeedError> {
        self.feeds.lock().map_err(|_| FeedError::Poisoned)
    }

    fn spawn_feed(&self, key: SubscriptionKey) -> JoinHandle<()> {
        let connector = self.connectors.get(&key.spec.exchange);
        let sink = self.channels.clone();
        let delay = self.reconnect_delay;
        let counters = Arc::clone(&self.counters);
        self.runtime
            .spawn(supervise(key, connector, sink, delay, counters))
    }
}

impl FeedProvider for StreamingFeedHub {
    #[instrument(skip_all, fields(required = keys.len()))]
    fn set_required_keys(&self, keys: &HashSet<SubscriptionKey>) -> Result<(), FeedError> {
        let mut feeds = self.lock()?;

        let before = feeds.len();
        feeds.retain(|key, task| {
            let keep = keys.contains(key);
            if !keep {
                debug!(%key, "Closing upstream feed");
                task.abort();
            }
            keep
        });
        let closed = before - feeds.len();

        let mut opened = 0_usize;
        for key in keys {
            if !feeds.contains_key(key) {
                debug!(%key, "Opening upstream feed");
                let task = self.spawn_feed(key.clone());
                feeds.insert(key.clone(), task);
                opened += 1;
            }
        }

        if opened > 0 || closed > 0 {
            info!(opened, closed, active = feeds.len(), "Upstream feeds updated");
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

impl Drop for StreamingFeedHub {
    fn drop(&mut self) {
        let feeds = self.feeds.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in feeds.drain() {
            task.abort();
        }
    }
}

/// Run `key`'s connector forever, reporting each failure on its stream.
async fn supervise(
    key: SubscriptionKey,
    connector: Option<Arc<dyn ExchangeConnector>>,
    sink: FeedChannels,
    delay: Duration,
    counters: Arc<HubCounters>,
) {
    loop {
        counters.attempts.fetch_add(1, Ordering::Relaxed);

        let outcome = match &connector {
            None => Err(anyhow::anyhow!("Unknown exchange '{}'", key.spec.exchange)),
            Some(c) if !c.supports(key.kind) => Err(anyhow::anyhow!(
                "Exchange '{}' does not provide {}",
                c.exchange(),
                key.kind
            )),
            Some(c) => c.stream(&key, &sink).await,
        };

        match outcome {
            Ok(()) => info!(%key, "Upstream feed closed, reopening"),
            Err(e) => {
                let reason = format!("{e:#}");
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %reason, retry_ms = delay.as_millis(), "Upstream feed failed");
                sink.publish_failure(FeedFailure {
                    key: key.clone(),
                    reason,
                });
            }
        }

        tokio::time::sleep(delay).await;
    }
}
