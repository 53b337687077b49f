//! Subscription Registry - Ref-counted Subscriber Interest
//!
//! Tracks which subscription keys every subscriber wants, counts how many
//! subscribers want each key and tells the feed provider the full set of
//! required keys whenever that set changes. One `RwLock` guards all of it:
//! changes take the write side, view snapshots take the read side, so a
//! view is always built from a state some serial order of changes produced.
//!
//! The provider is notified inside the write-side critical section. It
//! only spawns or aborts tasks there, never does I/O.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::live_view::{LiveView, ViewHandle};
use crate::domain::events::SpecEvent;
use crate::domain::{
  BalanceEvent, DataKind, MarketEvent, OpenOrdersEvent, OrderBookEvent, SubscriberId,
  SubscriptionKey, TickerEvent, TickerSpec, TradeEvent, TradeHistoryEvent,
};
use crate::ports::market_feed::{FeedError, FeedItem, FeedProvider};

#[derive(Debug, Error)]
pub enum RegistryError {
  /// A thread panicked while holding the registry lock. Not recoverable.
  #[error("subscription registry lock poisoned")]
  Poisoned,
  /// A view was requested with no runtime captured and none current.
  #[error("no Tokio runtime available for view tasks")]
  NoRuntime,
  #[error(transparent)]
  Feed(#[from] FeedError),
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
  /// Subscribers with a non-empty key set.
  pub subscribers: usize,
  /// Distinct keys with at least one holder.
  pub required_keys: usize,
  /// Provider notifications sent since start.
  pub notifications: u64,
  /// Callback handles held for single-key registrations.
  pub live_handles: usize,
}

#[derive(Debug, Default)]
struct SubscriptionState {
  by_subscriber: HashMap<SubscriberId, HashSet<SubscriptionKey>>,
  ref_counts: HashMap<SubscriptionKey, NonZeroUsize>,
  handles: HashMap<SubscriberId, Vec<ViewHandle>>,
}

impl SubscriptionState {
  /// Count one more holder. Returns true if the key is new.
  fn acquire(&mut self, key: &SubscriptionKey) -> bool {
    if let Some(count) = self.ref_counts.get_mut(key) {
      *count = count.saturating_add(1);
      debug!(%key, refs = count.get(), "Key already held, incremented");
      return false;
    }
    self.ref_counts.insert(key.clone(), NonZeroUsize::MIN);
    debug!(%key, "Key newly required");
    true
  }

  /// Drop one holder. Returns true if the key is gone.
  fn release(&mut self, subscriber: &str, key: &SubscriptionKey) -> bool {
    let Some(count) = self.ref_counts.get(key).copied() else {
      warn!(subscriber, %key, "No refcount for held key, treating as removed");
      return true;
    };
    match NonZeroUsize::new(count.get() - 1) {
      Some(remaining) => {
        self.ref_counts.insert(key.clone(), remaining);
        debug!(%key, refs = remaining.get(), "Key still held, decremented");
        false
      }
      None => {
        self.ref_counts.remove(key);
        debug!(%key, "Last holder gone, key no longer required");
        true
      }
    }
  }

  fn specs_of(&self, subscriber: &str, kind: DataKind) -> HashSet<TickerSpec> {
    self
      .by_subscriber
      .get(subscriber)
      .map(|keys| {
        keys
          .iter()
          .filter(|key| key.kind == kind)
          .map(|key| key.spec.clone())
          .collect()
      })
      .unwrap_or_default()
  }

  fn required(&self) -> HashSet<SubscriptionKey> {
    self.ref_counts.keys().cloned().collect()
  }
}

/// Process-wide subscription state and the only writer of it.
pub struct SubscriptionRegistry {
  state: RwLock<SubscriptionState>,
  provider: Arc<dyn FeedProvider>,
  /// Runtime view pumps and callbacks are spawned on.
  runtime: Option<Handle>,
  notifications: AtomicU64,
}

impl SubscriptionRegistry {
  /// Create a registry, capturing the current Tokio runtime if there is
  /// one. Without it, views can only be built from runtime threads.
  pub fn new(provider: Arc<dyn FeedProvider>) -> Self {
    Self::build(provider, Handle::try_current().ok())
  }

  /// Create a registry whose views run on `runtime`, usable from any thread.
  pub fn with_runtime(provider: Arc<dyn FeedProvider>, runtime: Handle) -> Self {
    Self::build(provider, Some(runtime))
  }

  fn build(provider: Arc<dyn FeedProvider>, runtime: Option<Handle>) -> Self {
    Self {
      state: RwLock::new(SubscriptionState::default()),
      provider,
      runtime,
      notifications: AtomicU64::new(0),
    }
  }

  /// Replace `subscriber`'s whole key set with `target`.
  ///
  /// Returns whether the global required set changed, in which case the
  /// provider was notified exactly once. An empty `target` drops the
  /// subscriber and releases any callback handles it still owns.
  #[instrument(skip(self, target), fields(target = target.len()))]
  pub fn change_subscriptions(
    &self,
    subscriber: &str,
    target: HashSet<SubscriptionKey>,
  ) -> Result<bool, RegistryError> {
    let (changed, orphans) = {
      let mut state = self.write()?;
      self.apply(&mut state, subscriber, target)?
    };
    release_all(subscriber, orphans);
    Ok(changed)
  }

  /// Add `key` to `subscriber`'s set and run `callback` for every item
  /// on that key until the subscriber is unregistered.
  ///
  /// Callable from any thread once the registry has a runtime. The view
  /// is built outside the write lock; if the subscriber is cleared in the
  /// meantime the new handle is released instead of kept.
  #[instrument(skip(self, callback), fields(%key))]
  pub fn register_single<F>(
    &self,
    key: SubscriptionKey,
    subscriber: &str,
    callback: F,
  ) -> Result<(), RegistryError>
  where
    F: Fn(FeedItem<MarketEvent>) + Send + Sync + 'static,
  {
    let runtime = self.runtime()?;
    let (_, orphans) = {
      let mut state = self.write()?;
      let mut target = state.by_subscriber.get(subscriber).cloned().unwrap_or_default();
      target.insert(key.clone());
      self.apply(&mut state, subscriber, target)?
    };
    release_all(subscriber, orphans);

    let handle = self
      .envelope(&runtime, key.kind, HashSet::from([key.spec.clone()]))
      .attach(callback);

    let mut state = self.write()?;
    let held = state
      .by_subscriber
      .get(subscriber)
      .is_some_and(|keys| keys.contains(&key));
    if held {
      state.handles.entry(subscriber.to_string()).or_default().push(handle);
      return Ok(());
    }
    drop(state);
    debug!(subscriber, "Subscriber cleared during registration, dropping handle");
    handle.release();
    Ok(())
  }

  /// Release every callback handle `subscriber` owns, then clear its keys.
  ///
  /// Safe to repeat and safe for unknown subscribers.
  #[instrument(skip(self), fields(%key))]
  pub fn unregister_single(
    &self,
    key: &SubscriptionKey,
    subscriber: &str,
  ) -> Result<(), RegistryError> {
    let handles = self.write()?.handles.remove(subscriber).unwrap_or_default();
    if handles.is_empty() {
      debug!(subscriber, "No live handles to release");
    }
    release_all(subscriber, handles);
    self.change_subscriptions(subscriber, HashSet::new())?;
    Ok(())
  }

  // ── Filtered views ──

  pub fn tickers(&self, subscriber: &str) -> Result<LiveView<TickerEvent>, RegistryError> {
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, DataKind::Ticker)?;
    Ok(LiveView::filtered(&runtime, self.provider.tickers(), spec_filter(specs)))
  }

  pub fn order_books(
    &self,
    subscriber: &str,
  ) -> Result<LiveView<OrderBookEvent>, RegistryError> {
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, DataKind::OrderBook)?;
    Ok(LiveView::filtered(&runtime, self.provider.order_books(), spec_filter(specs)))
  }

  pub fn trades(&self, subscriber: &str) -> Result<LiveView<TradeEvent>, RegistryError> {
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, DataKind::Trade)?;
    Ok(LiveView::filtered(&runtime, self.provider.trades(), spec_filter(specs)))
  }

  pub fn user_trade_history(
    &self,
    subscriber: &str,
  ) -> Result<LiveView<TradeHistoryEvent>, RegistryError> {
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, DataKind::UserTradeHistory)?;
    Ok(LiveView::filtered(&runtime, self.provider.user_trade_history(), spec_filter(specs)))
  }

  /// Balances for any currency appearing in the subscriber's ticker keys.
  pub fn balances(&self, subscriber: &str) -> Result<LiveView<BalanceEvent>, RegistryError> {
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, DataKind::Ticker)?;
    Ok(LiveView::filtered(&runtime, self.provider.balances(), balance_filter(specs)))
  }

  pub fn open_orders(
    &self,
    subscriber: &str,
  ) -> Result<LiveView<OpenOrdersEvent>, RegistryError> {
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, DataKind::OpenOrders)?;
    Ok(LiveView::filtered(&runtime, self.provider.open_orders(), spec_filter(specs)))
  }

  // Split views: one independent view per subscribed key, ordered by spec.

  pub fn tickers_split(
    &self,
    subscriber: &str,
  ) -> Result<Vec<(TickerSpec, LiveView<TickerEvent>)>, RegistryError> {
    self.split(subscriber, DataKind::Ticker, || self.provider.tickers())
  }

  pub fn order_books_split(
    &self,
    subscriber: &str,
  ) -> Result<Vec<(TickerSpec, LiveView<OrderBookEvent>)>, RegistryError> {
    self.split(subscriber, DataKind::OrderBook, || self.provider.order_books())
  }

  pub fn trades_split(
    &self,
    subscriber: &str,
  ) -> Result<Vec<(TickerSpec, LiveView<TradeEvent>)>, RegistryError> {
    self.split(subscriber, DataKind::Trade, || self.provider.trades())
  }

  pub fn user_trade_history_split(
    &self,
    subscriber: &str,
  ) -> Result<Vec<(TickerSpec, LiveView<TradeHistoryEvent>)>, RegistryError> {
    self.split(subscriber, DataKind::UserTradeHistory, || {
      self.provider.user_trade_history()
    })
  }

  pub fn open_orders_split(
    &self,
    subscriber: &str,
  ) -> Result<Vec<(TickerSpec, LiveView<OpenOrdersEvent>)>, RegistryError> {
    self.split(subscriber, DataKind::OpenOrders, || self.provider.open_orders())
  }

  /// View of one kind wrapped in `MarketEvent`, filtered like the typed
  /// accessor for that kind.
  pub fn events(
    &self,
    subscriber: &str,
    kind: DataKind,
  ) -> Result<LiveView<MarketEvent>, RegistryError> {
    let basis = match kind {
      DataKind::Balance => DataKind::Ticker,
      other => other,
    };
    let runtime = self.runtime()?;
    let specs = self.snapshot(subscriber, basis)?;
    Ok(self.envelope(&runtime, kind, specs))
  }

  // ── Read accessors ──

  pub fn subscriptions_of(
    &self,
    subscriber: &str,
  ) -> Result<HashSet<SubscriptionKey>, RegistryError> {
    Ok(self.read()?.by_subscriber.get(subscriber).cloned().unwrap_or_default())
  }

  /// Number of subscribers holding `key`; zero when not required.
  pub fn ref_count(&self, key: &SubscriptionKey) -> Result<usize, RegistryError> {
    Ok(self.read()?.ref_counts.get(key).map_or(0, |count| count.get()))
  }

  pub fn required_keys(&self) -> Result<HashSet<SubscriptionKey>, RegistryError> {
    Ok(self.read()?.required())
  }

  pub fn stats(&self) -> Result<RegistryStats, RegistryError> {
    let state = self.read()?;
    Ok(RegistryStats {
      subscribers: state.by_subscriber.len(),
      required_keys: state.ref_counts.len(),
      notifications: self.notifications.load(Ordering::Relaxed),
      live_handles: state.handles.values().map(Vec::len).sum(),
    })
  }

  // ── Internals ──

  /// Diff and apply under the write lock. Returns whether the required
  /// set changed plus handles to release once the lock is dropped.
  fn apply(
    &self,
    state: &mut SubscriptionState,
    subscriber: &str,
    target: HashSet<SubscriptionKey>,
  ) -> Result<(bool, Vec<ViewHandle>), RegistryError> {
    let orphans = if target.is_empty() {
      state.handles.remove(subscriber).unwrap_or_default()
    } else {
      Vec::new()
    };

    let Some(current) = state.by_subscriber.get(subscriber) else {
      if target.is_empty() {
        debug!(subscriber, "Subscriber not tracked, nothing to clear");
        return Ok((false, orphans));
      }
      return self.commit(state, subscriber, &HashSet::new(), target, orphans);
    };

    if *current == target {
      debug!(subscriber, "Subscriptions unchanged");
      return Ok((false, orphans));
    }
    let current = current.clone();
    self.commit(state, subscriber, &current, target, orphans)
  }

  fn commit(
    &self,
    state: &mut SubscriptionState,
    subscriber: &str,
    current: &HashSet<SubscriptionKey>,
    target: HashSet<SubscriptionKey>,
    orphans: Vec<ViewHandle>,
  ) -> Result<(bool, Vec<ViewHandle>), RegistryError> {
    let mut removed = 0_usize;
    let mut added = 0_usize;

    for key in current.difference(&target) {
      if state.release(subscriber, key) {
        removed += 1;
      }
    }
    for key in target.difference(current) {
      if state.acquire(key) {
        added += 1;
      }
    }

    if target.is_empty() {
      state.by_subscriber.remove(subscriber);
    } else {
      state.by_subscriber.insert(subscriber.to_string(), target);
    }

    if added == 0 && removed == 0 {
      return Ok((false, orphans));
    }

    let required = state.required();
    self.notifications.fetch_add(1, Ordering::Relaxed);
    info!(
      subscriber,
      added,
      removed,
      required = required.len(),
      "Required feed set changed"
    );
    self.provider.set_required_keys(&required)?;
    Ok((true, orphans))
  }

  fn snapshot(&self, subscriber: &str, kind: DataKind) -> Result<HashSet<TickerSpec>, RegistryError> {
    Ok(self.read()?.specs_of(subscriber, kind))
  }

  fn split<E, S>(
    &self,
    subscriber: &str,
    kind: DataKind,
    upstream: S,
  ) -> Result<Vec<(TickerSpec, LiveView<E>)>, RegistryError>
  where
    E: SpecEvent + Clone + Send + Sync + 'static,
    S: Fn() -> broadcast::Receiver<FeedItem<E>>,
  {
    let runtime = self.runtime()?;
    let mut specs: Vec<TickerSpec> = self.snapshot(subscriber, kind)?.into_iter().collect();
    specs.sort();
    Ok(
      specs
        .into_iter()
        .map(|spec| {
          let accept = spec_filter(HashSet::from([spec.clone()]));
          let view = LiveView::filtered(&runtime, upstream(), accept);
          (spec, view)
        })
        .collect(),
    )
  }

  /// `MarketEvent` view of `kind` restricted to `specs`. For balances the
  /// specs contribute their currencies.
  fn envelope(
    &self,
    runtime: &Handle,
    kind: DataKind,
    specs: HashSet<TickerSpec>,
  ) -> LiveView<MarketEvent> {
    match kind {
      DataKind::Ticker => wrap(runtime, self.provider.tickers(), spec_filter(specs)),
      DataKind::OrderBook => wrap(runtime, self.provider.order_books(), spec_filter(specs)),
      DataKind::Trade => wrap(runtime, self.provider.trades(), spec_filter(specs)),
      DataKind::UserTradeHistory => {
        wrap(runtime, self.provider.user_trade_history(), spec_filter(specs))
      }
      DataKind::Balance => wrap(runtime, self.provider.balances(), balance_filter(specs)),
      DataKind::OpenOrders => wrap(runtime, self.provider.open_orders(), spec_filter(specs)),
    }
  }

  /// Captured runtime, else the caller's.
  fn runtime(&self) -> Result<Handle, RegistryError> {
    self
      .runtime
      .clone()
      .or_else(|| Handle::try_current().ok())
      .ok_or(RegistryError::NoRuntime)
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, SubscriptionState>, RegistryError> {
    self.state.read().map_err(|_| RegistryError::Poisoned)
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, SubscriptionState>, RegistryError> {
    self.state.write().map_err(|_| RegistryError::Poisoned)
  }
}

fn release_all(subscriber: &str, handles: Vec<ViewHandle>) {
  if handles.is_empty() {
    return;
  }
  debug!(subscriber, count = handles.len(), "Releasing callback handles");
  for handle in &handles {
    handle.release();
  }
}

/// Accept events and failures whose spec is in `specs`.
fn spec_filter<E>(specs: HashSet<TickerSpec>) -> impl Fn(&FeedItem<E>) -> bool + Send + 'static
where
  E: SpecEvent + 'static,
{
  move |item| match item {
    Ok(event) => specs.contains(event.spec()),
    Err(failure) => specs.contains(&failure.key.spec),
  }
}

/// Accept balances for any base or counter currency of `specs`.
fn balance_filter(
  specs: HashSet<TickerSpec>,
) -> impl Fn(&FeedItem<BalanceEvent>) -> bool + Send + 'static {
  let currencies: HashSet<String> = specs
    .into_iter()
    .flat_map(|spec| [spec.base, spec.counter])
    .collect();
  move |item| match item {
    Ok(event) => currencies.contains(&event.currency),
    Err(failure) => currencies.iter().any(|currency| failure.key.spec.involves(currency)),
  }
}

fn wrap<E, F>(
  runtime: &Handle,
  upstream: broadcast::Receiver<FeedItem<E>>,
  accept: F,
) -> LiveView<MarketEvent>
where
  E: Into<MarketEvent> + Clone + Send + 'static,
  F: Fn(&FeedItem<E>) -> bool + Send + 'static,
{
  LiveView::spawn(runtime, upstream, move |item| {
    accept(&item).then(|| item.map(Into::into))
  })
}
