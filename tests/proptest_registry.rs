//! Property-Based Tests - Subscription Registry Invariants
//!
//! Uses `proptest` to drive the registry with random sequences of
//! subscription changes and check it against a plain model: every
//! refcount equals the number of holders, the provider always holds the
//! union of all subscribers' keys, and it hears about a change exactly
//! when that union moves.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tokio::sync::broadcast;

use market_event_bus::domain::{
    BalanceEvent, DataKind, OpenOrdersEvent, OrderBookEvent, SubscriptionKey, TickerEvent,
    TickerSpec, TradeEvent, TradeHistoryEvent,
};
use market_event_bus::ports::market_feed::{FeedChannels, FeedError, FeedItem, FeedProvider};
use market_event_bus::usecases::SubscriptionRegistry;

/// Provider that remembers every required set it was given.
struct Recorder {
    channels: FeedChannels,
    calls: Mutex<Vec<HashSet<SubscriptionKey>>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            channels: FeedChannels::new(4),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<HashSet<SubscriptionKey>> {
        self.calls.lock().unwrap().clone()
    }
}

impl FeedProvider for Recorder {
    fn set_required_keys(&self, keys: &HashSet<SubscriptionKey>) -> Result<(), FeedError> {
        self.calls
            .lock()
            .map_err(|_| FeedError::Poisoned)?
            .push(keys.clone());
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

/// Small key universe so random subscribers overlap often.
fn universe() -> Vec<SubscriptionKey> {
    let mut keys = Vec::new();
    for base in ["BTC", "ETH", "SOL"] {
        for kind in [DataKind::Ticker, DataKind::Trade] {
            keys.push(SubscriptionKey::new(TickerSpec::new("x", base, "USD"), kind));
        }
    }
    keys
}

/// (subscriber index, bitmask over the universe)
fn change() -> impl Strategy<Value = (usize, u8)> {
    (0usize..4, 0u8..64)
}

fn pick(mask: u8, universe: &[SubscriptionKey]) -> HashSet<SubscriptionKey> {
    universe
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, key)| key.clone())
        .collect()
}

fn union(model: &HashMap<String, HashSet<SubscriptionKey>>) -> HashSet<SubscriptionKey> {
    model.values().flatten().cloned().collect()
}

// ── Refcount Properties ─────────────────────────────────────

proptest! {
    /// Refcounts, required set and provider notifications track the model.
    #[test]
    fn registry_matches_model(changes in prop::collection::vec(change(), 1..40)) {
        let universe = universe();
        let provider = Arc::new(Recorder::new());
        let registry = SubscriptionRegistry::new(provider.clone());
        let mut model: HashMap<String, HashSet<SubscriptionKey>> = HashMap::new();
        let mut expected_calls = 0usize;

        for (who, mask) in changes {
            let subscriber = format!("s{who}");
            let target = pick(mask, &universe);

            let before = union(&model);
            if target.is_empty() {
                model.remove(&subscriber);
            } else {
                model.insert(subscriber.clone(), target.clone());
            }
            let after = union(&model);

            let notified = registry.change_subscriptions(&subscriber, target).unwrap();
            prop_assert_eq!(notified, before != after);
            if notified {
                expected_calls += 1;
            }

            for key in &universe {
                let holders = model.values().filter(|keys| keys.contains(key)).count();
                prop_assert_eq!(registry.ref_count(key).unwrap(), holders);
            }
            prop_assert_eq!(registry.required_keys().unwrap(), after.clone());
            prop_assert_eq!(registry.stats().unwrap().subscribers, model.len());

            let calls = provider.calls();
            prop_assert_eq!(calls.len(), expected_calls);
            if let Some(last) = calls.last() {
                prop_assert_eq!(last, &after);
            }
        }
    }

    /// Clearing every subscriber always returns the bus to empty.
    #[test]
    fn clearing_everyone_releases_everything(changes in prop::collection::vec(change(), 1..20)) {
        let universe = universe();
        let provider = Arc::new(Recorder::new());
        let registry = SubscriptionRegistry::new(provider.clone());

        for (who, mask) in &changes {
            registry.change_subscriptions(&format!("s{who}"), pick(*mask, &universe)).unwrap();
        }
        for who in 0..4 {
            registry.change_subscriptions(&format!("s{who}"), HashSet::new()).unwrap();
        }

        prop_assert!(registry.required_keys().unwrap().is_empty());
        prop_assert_eq!(registry.stats().unwrap().subscribers, 0);
        if let Some(last) = provider.calls().last() {
            prop_assert!(last.is_empty());
        }
    }

    /// Applying the same target twice never notifies the second time.
    #[test]
    fn same_target_is_idempotent(who in 0usize..4, mask in 0u8..64) {
        let universe = universe();
        let registry = SubscriptionRegistry::new(Arc::new(Recorder::new()));
        let target = pick(mask, &universe);

        registry.change_subscriptions(&format!("s{who}"), target.clone()).unwrap();
        let again = registry.change_subscriptions(&format!("s{who}"), target).unwrap();
        prop_assert!(!again);
    }
}
