//! Watchlist - Config-Driven Background Subscriber
//!
//! Holds the keys listed under `[[watchlist]]` in config.toml with a
//! fixed subscriber id, follows config reloads and logs every ticker it
//! receives. Shares upstream feeds with push connections like any other
//! subscriber. On shutdown it clears its keys.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::live_view::LiveView;
use super::subscription_registry::{RegistryError, SubscriptionRegistry};
use crate::config::AppConfig;
use crate::domain::{SubscriptionKey, TickerEvent};

/// Subscriber id of the watchlist.
pub const WATCHLIST_SUBSCRIBER: &str = "config-watchlist";

pub struct Watchlist {
  registry: Arc<SubscriptionRegistry>,
  config_rx: watch::Receiver<AppConfig>,
  shutdown_rx: broadcast::Receiver<()>,
  /// Ticks logged since start.
  ticks: u64,
}

impl Watchlist {
  pub fn new(
    registry: Arc<SubscriptionRegistry>,
    config_rx: watch::Receiver<AppConfig>,
    shutdown_rx: broadcast::Receiver<()>,
  ) -> Self {
    Self {
      registry,
      config_rx,
      shutdown_rx,
      ticks: 0,
    }
  }

  /// Hold `keys` and return a ticker view over them.
  fn apply(&self, keys: HashSet<SubscriptionKey>) -> Result<LiveView<TickerEvent>, RegistryError> {
    info!(keys = keys.len(), "Applying watchlist");
    self.registry.change_subscriptions(WATCHLIST_SUBSCRIBER, keys)?;
    self.registry.tickers(WATCHLIST_SUBSCRIBER)
  }

  /// Run until shutdown, re-applying the watchlist on every config change.
  #[instrument(skip(self), name = "watchlist")]
  pub async fn run(&mut self) -> Result<()> {
    let keys = self.config_rx.borrow_and_update().watchlist_keys();
    let mut view = self.apply(keys)?;
    let mut config_open = true;

    loop {
      tokio::select! {
        biased;
        _ = self.shutdown_rx.recv() => {
          info!(ticks = self.ticks, "Shutdown signal received, stopping watchlist");
          break;
        }
        changed = self.config_rx.changed(), if config_open => {
          if changed.is_err() {
            debug!("Config watcher gone, watchlist is now fixed");
            config_open = false;
            continue;
          }
          let keys = self.config_rx.borrow_and_update().watchlist_keys();
          view = self.apply(keys)?;
        }
        item = view.next() => {
          match item {
            Some(Ok(event)) => {
              self.ticks += 1;
              info!(
                spec = %event.spec,
                last = %event.ticker.last,
                bid = ?event.ticker.bid,
                ask = ?event.ticker.ask,
                "Tick"
              );
            }
            Some(Err(failure)) => {
              warn!(key = %failure.key, reason = %failure.reason, "Watched feed failed");
            }
            None => {
              warn!("Ticker stream closed, stopping watchlist");
              break;
            }
          }
        }
      }
    }

    self.registry.change_subscriptions(WATCHLIST_SUBSCRIBER, HashSet::new())?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::adapters::feeds::{ConnectorRegistry, SimulatedConnector, StreamingFeedHub};
  use crate::config::loader::parse_config;
  use crate::domain::{DataKind, TickerSpec};

  const CONFIG: &str = r#"
[service]
name = "bus"

[[exchanges]]
name = "simulated"

[[watchlist]]
exchange = "simulated"
base = "BTC"
counter = "USD"
"#;

  fn registry() -> Arc<SubscriptionRegistry> {
    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(SimulatedConnector::new(Duration::from_millis(5))));
    let hub = StreamingFeedHub::with_runtime(
      connectors,
      64,
      Duration::from_millis(50),
      tokio::runtime::Handle::current(),
    );
    Arc::new(SubscriptionRegistry::new(Arc::new(hub)))
  }

  #[tokio::test]
  async fn test_follows_config_and_clears_on_shutdown() {
    let registry = registry();
    let config = parse_config(CONFIG).unwrap();
    let (config_tx, config_rx) = watch::channel(config.clone());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let mut watchlist = Watchlist::new(Arc::clone(&registry), config_rx, shutdown_rx);
    let task = tokio::spawn(async move { watchlist.run().await });

    let btc = SubscriptionKey::ticker(TickerSpec::new("simulated", "BTC", "USD"));
    let eth = SubscriptionKey::new(TickerSpec::new("simulated", "ETH", "USD"), DataKind::Trade);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(registry.subscriptions_of(WATCHLIST_SUBSCRIBER).unwrap(), HashSet::from([btc]));

    let mut updated = config;
    updated.watchlist[0].base = "ETH".to_string();
    updated.watchlist[0].kinds = vec![DataKind::Trade];
    config_tx.send(updated).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(registry.subscriptions_of(WATCHLIST_SUBSCRIBER).unwrap(), HashSet::from([eth]));

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert!(registry.required_keys().unwrap().is_empty());
  }
}
