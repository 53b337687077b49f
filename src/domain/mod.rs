//! Domain layer - Subscription keys and market data events.
//!
//! Pure value types shared by every other layer. Nothing here performs
//! I/O or holds locks (hexagonal architecture inner ring).

pub mod events;
pub mod subscription;

// Re-export core types for convenience
pub use events::{
    Balance, BalanceEvent, MarketEvent, OpenOrder, OpenOrdersEvent, OrderBook,
    OrderBookEvent, PriceLevel, SpecEvent, Ticker, TickerEvent, Trade, TradeEvent,
    TradeHistoryEvent, TradeSide, UserTrade,
};
pub use subscription::{DataKind, KeyError, SubscriberId, SubscriptionKey, TickerSpec};
