//! Market Data Feed Adapters - Upstream Exchange Streaming
//!
//! - Hub: the `FeedProvider`; one supervised task per required key
//! - Connectors: name-to-constructor table for exchange connectors
//! - Binance: ticker, trade and depth streams
//! - Coinbase: ticker and matches channels
//! - Simulated: deterministic data for every kind, no network

pub mod binance;
pub mod coinbase;
pub mod connectors;
pub mod hub;
pub mod simulated;

pub use binance::BinanceConnector;
pub use coinbase::CoinbaseConnector;
pub use connectors::ConnectorRegistry;
pub use hub::{HubStats, StreamingFeedHub};
pub use simulated::SimulatedConnector;
