//! Binance WebSocket Connector - Ticker, Trade and Depth Streams
//!
//! Opens one raw stream per subscription key
//! (`<symbol>@ticker`, `<symbol>@trade`, `<symbol>@depth10@100ms`)
//! and republishes every message on the hub's merged channels.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument};

use crate::config::ExchangeConfig;
use crate::domain::{
    DataKind, OrderBook, OrderBookEvent, PriceLevel, SubscriptionKey, Ticker, TickerEvent, Trade,
    TradeEvent, TradeSide,
};
use crate::ports::exchange::ExchangeConnector;
use crate::ports::market_feed::FeedChannels;

const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Binance 24hr rolling ticker message.
#[derive(Debug, Deserialize)]
struct TickerMsg {
    /// Event time (Unix ms).
    #[serde(rename = "E")]
    event_time: i64,
    /// Last price.
    #[serde(rename = "c")]
    last: Decimal,
    /// Best bid price.
    #[serde(rename = "b")]
    bid: Option<Decimal>,
    /// Best ask price.
    #[serde(rename = "a")]
    ask: Option<Decimal>,
    /// Total traded base asset volume.
    #[serde(rename = "v")]
    volume: Option<Decimal>,
}

/// Binance raw trade message.
#[derive(Debug, Deserialize)]
struct TradeMsg {
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    /// Trade time (Unix ms).
    #[serde(rename = "T")]
    trade_time: i64,
    /// Buyer was the maker, so the aggressor sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Binance partial book depth message.
#[derive(Debug, Deserialize)]
struct DepthMsg {
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

/// Binance spot market data connector.
pub struct BinanceConnector {
    /// WebSocket base URL without the stream path.
    ws_url: String,
}

impl BinanceConnector {
    pub fn new() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }

    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self {
            ws_url: config
                .ws_url
                .clone()
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
        }
    }

    /// Raw stream name for `key`, e.g. `btcusdt@ticker`.
    pub fn stream_name(key: &SubscriptionKey) -> Option<String> {
        let symbol = format!("{}{}", key.spec.base, key.spec.counter).to_lowercase();
        match key.kind {
            DataKind::Ticker => Some(format!("{symbol}@ticker")),
            DataKind::Trade => Some(format!("{symbol}@trade")),
            DataKind::OrderBook => Some(format!("{symbol}@depth10@100ms")),
            _ => None,
        }
    }

    /// Parse one message for `key` and publish it.
    fn handle_message(key: &SubscriptionKey, text: &str, sink: &FeedChannels) -> Result<()> {
        let spec = key.spec.clone();
        match key.kind {
            DataKind::Ticker => {
                let msg: TickerMsg = serde_json::from_str(text).context("Invalid ticker JSON")?;
                sink.publish_ticker(TickerEvent {
                    spec,
                    ticker: Ticker {
                        bid: msg.bid,
                        ask: msg.ask,
                        last: msg.last,
                        volume: msg.volume,
                        timestamp: from_millis(msg.event_time),
                    },
                });
            }
            DataKind::Trade => {
                let msg: TradeMsg = serde_json::from_str(text).context("Invalid trade JSON")?;
                sink.publish_trade(TradeEvent {
                    spec,
                    trade: Trade {
                        id: msg.trade_id.to_string(),
                        side: if msg.buyer_is_maker {
                            TradeSide::Sell
                        } else {
                            TradeSide::Buy
                        },
                        price: msg.price,
                        amount: msg.quantity,
                        timestamp: from_millis(msg.trade_time),
                    },
                });
            }
            DataKind::OrderBook => {
                let msg: DepthMsg = serde_json::from_str(text).context("Invalid depth JSON")?;
                sink.publish_order_book(OrderBookEvent {
                    spec,
                    order_book: OrderBook {
                        bids: levels(msg.bids),
                        asks: levels(msg.asks),
                        timestamp: Utc::now(),
                    },
                });
            }
            other => anyhow::bail!("Binance does not stream {other}"),
        }
        Ok(())
    }
}

impl Default for BinanceConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange(&self) -> &'static str {
        "binance"
    }

    fn supports(&self, kind: DataKind) -> bool {
        matches!(kind, DataKind::Ticker | DataKind::Trade | DataKind::OrderBook)
    }

    #[instrument(skip(self, sink), fields(%key))]
    async fn stream(&self, key: &SubscriptionKey, sink: &FeedChannels) -> Result<()> {
        let stream = Self::stream_name(key).with_context(|| format!("Binance does not stream {}", key.kind))?;
        let url = format!("{}/{stream}", self.ws_url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .context("Binance WebSocket connection failed")?;
        let (_write, mut read) = ws_stream.split();

        info!(%url, "Binance WebSocket connected");

        while let Some(msg) = read.next().await {
            match msg.context("Binance WebSocket error")? {
                Message::Text(text) => {
                    if let Err(e) = Self::handle_message(key, &text, sink) {
                        debug!(error = %e, "Failed to parse Binance message");
                    }
                }
                Message::Ping(data) => {
                    // Pong is handled automatically by tungstenite
                    debug!(len = data.len(), "Binance ping received");
                }
                Message::Close(frame) => {
                    info!(?frame, "Binance closed the stream");
                    return Ok(());
                }
                _ => {}
            }
        }

        anyhow::bail!("Binance WebSocket stream ended")
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn levels(raw: Vec<(Decimal, Decimal)>) -> Vec<PriceLevel> {
    raw.into_iter()
        .map(|(price, amount)| PriceLevel { price, amount })
        .collect()
}
