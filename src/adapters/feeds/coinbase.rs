//! Coinbase WebSocket Connector - Ticker and Match Channels
//!
//! One connection per subscription key, subscribed to the `ticker`
//! or `matches` channel of a single `BASE-COUNTER` product.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument};

use crate::config::ExchangeConfig;
use crate::domain::{
    DataKind, SubscriptionKey, Ticker, TickerEvent, Trade, TradeEvent, TradeSide,
};
use crate::ports::exchange::ExchangeConnector;
use crate::ports::market_feed::FeedChannels;

const DEFAULT_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// Coinbase WebSocket subscribe message.
#[derive(Serialize)]
struct SubscribeMsg<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    product_ids: [&'a str; 1],
    channels: [&'static str; 1],
}

/// Any Coinbase feed message; fields present depend on `type`.
#[derive(Debug, Deserialize)]
struct FeedMsg {
    #[serde(rename = "type")]
    msg_type: String,
    price: Option<Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    volume_24h: Option<Decimal>,
    trade_id: Option<u64>,
    /// Maker order side for matches.
    side: Option<String>,
    size: Option<Decimal>,
    time: Option<DateTime<Utc>>,
    message: Option<String>,
}

/// Coinbase Exchange market data connector.
pub struct CoinbaseConnector {
    ws_url: String,
}

impl CoinbaseConnector {
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

    /// Product id for `key`, e.g. `BTC-USD`.
    pub fn product_id(key: &SubscriptionKey) -> String {
        format!("{}-{}", key.spec.base, key.spec.counter)
    }

    const fn channel(kind: DataKind) -> Option<&'static str> {
        match kind {
            DataKind::Ticker => Some("ticker"),
            DataKind::Trade => Some("matches"),
            _ => None,
        }
    }

    /// Parse and publish one message.
    fn handle_message(key: &SubscriptionKey, text: &str, sink: &FeedChannels) -> Result<()> {
        let msg: FeedMsg = serde_json::from_str(text).context("Invalid Coinbase JSON")?;

        match msg.msg_type.as_str() {
            "ticker" if key.kind == DataKind::Ticker => {
                sink.publish_ticker(TickerEvent {
                    spec: key.spec.clone(),
                    ticker: Ticker {
                        bid: msg.best_bid,
                        ask: msg.best_ask,
                        last: msg.price.context("Missing price")?,
                        volume: msg.volume_24h,
                        timestamp: msg.time.unwrap_or_else(Utc::now),
                    },
                });
            }
            "match" | "last_match" if key.kind == DataKind::Trade => {
                // `side` is the maker's; the aggressor took the other side.
                let side = match msg.side.as_deref() {
                    Some("buy") => TradeSide::Sell,
                    Some("sell") => TradeSide::Buy,
                    other => anyhow::bail!("Unknown match side {other:?}"),
                };
                sink.publish_trade(TradeEvent {
                    spec: key.spec.clone(),
                    trade: Trade {
                        id: msg.trade_id.context("Missing trade_id")?.to_string(),
                        side,
                        price: msg.price.context("Missing price")?,
                        amount: msg.size.context("Missing size")?,
                        timestamp: msg.time.unwrap_or_else(Utc::now),
                    },
                });
            }
            "error" => {
                anyhow::bail!(
                    "Coinbase rejected subscription: {}",
                    msg.message.unwrap_or_default()
                );
            }
            other => debug!(msg_type = other, "Ignoring Coinbase message"),
        }
        Ok(())
    }
}

impl Default for CoinbaseConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeConnector for CoinbaseConnector {
    fn exchange(&self) -> &'static str {
        "coinbase"
    }

    fn supports(&self, kind: DataKind) -> bool {
        Self::channel(kind).is_some()
    }

    #[instrument(skip(self, sink), fields(%key))]
    async fn stream(&self, key: &SubscriptionKey, sink: &FeedChannels) -> Result<()> {
        let channel = Self::channel(key.kind)
            .with_context(|| format!("Coinbase does not stream {}", key.kind))?;
        let product_id = Self::product_id(key);

        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .context("Coinbase WebSocket connection failed")?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeMsg {
            msg_type: "subscribe",
            product_ids: [product_id.as_str()],
            channels: [channel],
        };
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await
            .context("Failed to send subscribe")?;

        info!(product = %product_id, channel, "Coinbase WebSocket subscribed");

        while let Some(msg) = read.next().await {
            match msg.context("Coinbase WS error")? {
                Message::Text(text) => {
                    // Subscription errors end the session; parse errors do not.
                    if let Err(e) = Self::handle_message(key, &text, sink) {
                        if text.contains("\"type\":\"error\"") {
                            return Err(e);
                        }
                        debug!(error = %e, "Failed to parse Coinbase message");
                    }
                }
                Message::Close(frame) => {
                    info!(?frame, "Coinbase closed the stream");
                    return Ok(());
                }
                _ => {}
            }
        }

        anyhow::bail!("Coinbase WS stream ended")
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::TickerSpec;

    fn key(kind: DataKind) -> SubscriptionKey {
        SubscriptionKey::new(TickerSpec::new("coinbase", "ETH", "USD"), kind)
    }

    #[test]
    fn test_product_id_and_support() {
        assert_eq!(CoinbaseConnector::product_id(&key(DataKind::Ticker)), "ETH-USD");
        let connector = CoinbaseConnector::new();
        assert!(connector.supports(DataKind::Trade));
        assert!(!connector.supports(DataKind::OrderBook));
    }

    #[test]
    fn test_ticker_message_published() {
        let sink = FeedChannels::new(4);
        let mut rx = sink.subscribe_tickers();
        let text = r#"{"type":"ticker","product_id":"ETH-USD","price":"2000.5","best_bid":"2000.4","best_ask":"2000.6","volume_24h":"10","time":"2024-01-01T00:00:00.000000Z"}"#;

        CoinbaseConnector::handle_message(&key(DataKind::Ticker), text, &sink).unwrap();

        let event = rx.try_recv().unwrap().unwrap();
        assert_eq!(event.ticker.last, dec!(2000.5));
        assert_eq!(event.ticker.bid, Some(dec!(2000.4)));
    }

    #[test]
    fn test_match_uses_taker_side() {
        let sink = FeedChannels::new(4);
        let mut rx = sink.subscribe_trades();
        let text = r#"{"type":"match","trade_id":7,"side":"buy","price":"1","size":"0.5","time":"2024-01-01T00:00:00Z"}"#;

        CoinbaseConnector::handle_message(&key(DataKind::Trade), text, &sink).unwrap();

        let trade = rx.try_recv().unwrap().unwrap().trade;
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.amount, dec!(0.5));
    }

    #[test]
    fn test_subscriptions_ack_ignored_and_error_reported() {
        let sink = FeedChannels::new(4);
        let ack = r#"{"type":"subscriptions","channels":[]}"#;
        assert!(CoinbaseConnector::handle_message(&key(DataKind::Ticker), ack, &sink).is_ok());

        let err = r#"{"type":"error","message":"Failed to subscribe"}"#;
        assert!(CoinbaseConnector::handle_message(&key(DataKind::Ticker), err, &sink).is_err());
    }
}
