//! Market data events carried on the bus.
//!
//! One event type per `DataKind`. Every event except balances is keyed
//! by the `TickerSpec` it belongs to; balances are keyed by exchange and
//! currency because an account holds a currency, not a pair.
//!
//! `MarketEvent` wraps all six for consumers that handle several kinds
//! through one channel (push connections, single-key callbacks).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::subscription::{DataKind, TickerSpec};

// ────────────────────────────────────────────
// Shared building blocks
// ────────────────────────────────────────────

/// Aggressor / order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

// ────────────────────────────────────────────
// Payloads
// ────────────────────────────────────────────

/// Top-of-book and last trade summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    /// Best bid, when the venue reports one.
    pub bid: Option<Decimal>,
    /// Best ask, when the venue reports one.
    pub ask: Option<Decimal>,
    /// Last traded price.
    pub last: Decimal,
    /// Rolling 24h base volume.
    pub volume: Option<Decimal>,
    /// Venue timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    /// Mid price if both sides are present.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Depth snapshot. Bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

/// Public trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Fill on the account's own order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTrade {
    pub id: String,
    pub order_id: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
}

/// Account balance for one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Resting order owned by the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────
// Events
// ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    pub spec: TickerSpec,
    pub ticker: Ticker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEvent {
    pub spec: TickerSpec,
    pub order_book: OrderBook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub spec: TickerSpec,
    pub trade: Trade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeHistoryEvent {
    pub spec: TickerSpec,
    pub trades: Vec<UserTrade>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEvent {
    pub exchange: String,
    pub currency: String,
    pub balance: Balance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrdersEvent {
    pub spec: TickerSpec,
    pub orders: Vec<OpenOrder>,
}

/// Events that belong to exactly one `TickerSpec`.
pub trait SpecEvent {
    /// Kind of feed this event travels on.
    const KIND: DataKind;

    fn spec(&self) -> &TickerSpec;
}

impl SpecEvent for TickerEvent {
    const KIND: DataKind = DataKind::Ticker;

    fn spec(&self) -> &TickerSpec {
        &self.spec
    }
}

impl SpecEvent for OrderBookEvent {
    const KIND: DataKind = DataKind::OrderBook;

    fn spec(&self) -> &TickerSpec {
        &self.spec
    }
}

impl SpecEvent for TradeEvent {
    const KIND: DataKind = DataKind::Trade;

    fn spec(&self) -> &TickerSpec {
        &self.spec
    }
}

impl SpecEvent for TradeHistoryEvent {
    const KIND: DataKind = DataKind::UserTradeHistory;

    fn spec(&self) -> &TickerSpec {
        &self.spec
    }
}

impl SpecEvent for OpenOrdersEvent {
    const KIND: DataKind = DataKind::OpenOrders;

    fn spec(&self) -> &TickerSpec {
        &self.spec
    }
}

/// Any event on the bus, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketEvent {
    Ticker(TickerEvent),
    OrderBook(OrderBookEvent),
    Trade(TradeEvent),
    UserTradeHistory(TradeHistoryEvent),
    Balance(BalanceEvent),
    OpenOrders(OpenOrdersEvent),
}

impl MarketEvent {
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Ticker(_) => DataKind::Ticker,
            Self::OrderBook(_) => DataKind::OrderBook,
            Self::Trade(_) => DataKind::Trade,
            Self::UserTradeHistory(_) => DataKind::UserTradeHistory,
            Self::Balance(_) => DataKind::Balance,
            Self::OpenOrders(_) => DataKind::OpenOrders,
        }
    }

    /// Pair the event belongs to; `None` for balances.
    pub fn spec(&self) -> Option<&TickerSpec> {
        match self {
            Self::Ticker(e) => Some(&e.spec),
            Self::OrderBook(e) => Some(&e.spec),
            Self::Trade(e) => Some(&e.spec),
            Self::UserTradeHistory(e) => Some(&e.spec),
            Self::OpenOrders(e) => Some(&e.spec),
            Self::Balance(_) => None,
        }
    }
}

impl From<TickerEvent> for MarketEvent {
    fn from(e: TickerEvent) -> Self {
        Self::Ticker(e)
    }
}

impl From<OrderBookEvent> for MarketEvent {
    fn from(e: OrderBookEvent) -> Self {
        Self::OrderBook(e)
    }
}

impl From<TradeEvent> for MarketEvent {
    fn from(e: TradeEvent) -> Self {
        Self::Trade(e)
    }
}

impl From<TradeHistoryEvent> for MarketEvent {
    fn from(e: TradeHistoryEvent) -> Self {
        Self::UserTradeHistory(e)
    }
}

impl From<BalanceEvent> for MarketEvent {
    fn from(e: BalanceEvent) -> Self {
        Self::Balance(e)
    }
}

impl From<OpenOrdersEvent> for MarketEvent {
    fn from(e: OpenOrdersEvent) -> Self {
        Self::OpenOrders(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(bid: Option<Decimal>, ask: Option<Decimal>) -> Ticker {
        Ticker {
            bid,
            ask,
            last: dec!(100),
            volume: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ticker_mid() {
        assert_eq!(ticker(Some(dec!(99)), Some(dec!(101))).mid(), Some(dec!(100)));
        assert_eq!(ticker(None, Some(dec!(101))).mid(), None);
    }

    #[test]
    fn test_market_event_kind_and_spec() {
        let spec = TickerSpec::new("binance", "BTC", "USDT");
        let event: MarketEvent = TickerEvent {
            spec: spec.clone(),
            ticker: ticker(None, None),
        }
        .into();
        assert_eq!(event.kind(), DataKind::Ticker);
        assert_eq!(event.spec(), Some(&spec));

        let balance: MarketEvent = BalanceEvent {
            exchange: "binance".to_string(),
            currency: "BTC".to_string(),
            balance: Balance {
                total: dec!(1),
                available: dec!(0.5),
            },
        }
        .into();
        assert_eq!(balance.kind(), DataKind::Balance);
        assert!(balance.spec().is_none());
    }

    #[test]
    fn test_decimals_serialize_as_strings() {
        let level = PriceLevel {
            price: dec!(0.10),
            amount: dec!(3),
        };
        let json = serde_json::to_string(&level).unwrap();
        assert_eq!(json, r#"{"price":"0.10","amount":"3"}"#);
    }

    #[test]
    fn test_trade_side_display() {
        assert_eq!(TradeSide::Buy.to_string(), "BUY");
        assert_eq!(TradeSide::Sell.to_string(), "SELL");
    }
}
