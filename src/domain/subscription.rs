//! Subscription keys: what a subscriber can ask the bus for.
//!
//! A `SubscriptionKey` names one kind of data for one instrument on one
//! exchange. Keys are plain values: equal keys requested by different
//! subscribers collapse onto a single upstream feed.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identity of a subscriber (one per connection, or a fixed id
/// for a background consumer).
pub type SubscriberId = String;

/// Rejected key components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} contains an invalid character: {value:?}")]
    InvalidCharacter { field: &'static str, value: String },
}

/// Exchange plus base/counter currency pair.
///
/// Exchange names are lowercase and currency codes uppercase; the
/// constructor normalises both so `"Binance"`/`"btc"` and
/// `"binance"`/`"BTC"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TickerSpec {
    /// Exchange identifier (e.g., "binance").
    pub exchange: String,
    /// Base currency code (e.g., "BTC").
    pub base: String,
    /// Counter currency code (e.g., "USDT").
    pub counter: String,
}

impl TickerSpec {
    /// Build a normalised spec.
    pub fn new(
        exchange: impl Into<String>,
        base: impl Into<String>,
        counter: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into().trim().to_lowercase(),
            base: base.into().trim().to_uppercase(),
            counter: counter.into().trim().to_uppercase(),
        }
    }

    /// Whether `currency` is either side of the pair.
    pub fn involves(&self, currency: &str) -> bool {
        self.base == currency || self.counter == currency
    }

    /// Reject empty components and characters that cannot appear in a
    /// symbol on any supported exchange.
    pub fn validate(&self) -> Result<(), KeyError> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("base", &self.base),
            ("counter", &self.counter),
        ] {
            if value.is_empty() {
                return Err(KeyError::Empty { field });
            }
            if value.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
                return Err(KeyError::InvalidCharacter {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Copy with components re-normalised. Deserialized specs bypass
    /// `new`, so wire input goes through here.
    pub fn normalized(&self) -> Self {
        Self::new(&*self.exchange, &*self.base, &*self.counter)
    }
}

impl fmt::Display for TickerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.base, self.counter, self.exchange)
    }
}

/// Kind of market data carried by a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    Ticker,
    OrderBook,
    Trade,
    UserTradeHistory,
    Balance,
    OpenOrders,
}

impl DataKind {
    /// Wire name (`TICKER`, `ORDER_BOOK`, ...).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "TICKER",
            Self::OrderBook => "ORDER_BOOK",
            Self::Trade => "TRADE",
            Self::UserTradeHistory => "USER_TRADE_HISTORY",
            Self::Balance => "BALANCE",
            Self::OpenOrders => "OPEN_ORDERS",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (instrument, data kind) feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Exchange and currency pair.
    #[serde(flatten)]
    pub spec: TickerSpec,
    /// Data kind.
    pub kind: DataKind,
}

impl SubscriptionKey {
    pub fn new(spec: TickerSpec, kind: DataKind) -> Self {
        Self { spec, kind }
    }

    /// Ticker key for `spec`.
    pub fn ticker(spec: TickerSpec) -> Self {
        Self::new(spec, DataKind::Ticker)
    }

    /// Validate after normalising; returns the canonical key.
    pub fn validated(&self) -> Result<Self, KeyError> {
        let spec = self.spec.normalized();
        spec.validate()?;
        Ok(Self::new(spec, self.kind))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.spec)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_spec_normalises_case() {
        let spec = TickerSpec::new("Binance", "btc", " usdt ");
        assert_eq!(spec.exchange, "binance");
        assert_eq!(spec.base, "BTC");
        assert_eq!(spec.counter, "USDT");
        assert_eq!(spec.to_string(), "BTC/USDT@binance");
    }

    #[test]
    fn test_equal_keys_deduplicate() {
        let a = SubscriptionKey::ticker(TickerSpec::new("binance", "BTC", "USDT"));
        let b = SubscriptionKey::ticker(TickerSpec::new("BINANCE", "btc", "usdt"));
        let c = SubscriptionKey::new(
            TickerSpec::new("binance", "BTC", "USDT"),
            DataKind::Trade,
        );
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_validate_rejects_empty_and_separators() {
        assert_eq!(
            TickerSpec::new("", "BTC", "USD").validate(),
            Err(KeyError::Empty { field: "exchange" })
        );
        assert!(matches!(
            TickerSpec::new("binance", "BTC/USD", "USD").validate(),
            Err(KeyError::InvalidCharacter { field: "base", .. })
        ));
        assert!(TickerSpec::new("binance", "BTC", "USD").validate().is_ok());
    }

    #[test]
    fn test_key_wire_format() {
        let json = r#"{"exchange":"Coinbase","base":"eth","counter":"USD","kind":"ORDER_BOOK"}"#;
        let key: SubscriptionKey = serde_json::from_str(json).unwrap();
        let key = key.validated().unwrap();
        assert_eq!(key.spec, TickerSpec::new("coinbase", "ETH", "USD"));
        assert_eq!(key.kind, DataKind::OrderBook);
        assert_eq!(key.to_string(), "ORDER_BOOK ETH/USD@coinbase");
    }

    #[test]
    fn test_involves_either_side() {
        let spec = TickerSpec::new("binance", "ETH", "BTC");
        assert!(spec.involves("ETH"));
        assert!(spec.involves("BTC"));
        assert!(!spec.involves("USD"));
    }
}
