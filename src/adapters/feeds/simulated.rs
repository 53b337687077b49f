//! Simulated exchange connector.
//!
//! Emits deterministic data for every data kind at a fixed interval.
//! Used for local runs and demos without network access.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::config::ExchangeConfig;
use crate::domain::{
    Balance, BalanceEvent, DataKind, OpenOrder, OpenOrdersEvent, OrderBook, OrderBookEvent,
    PriceLevel, SubscriptionKey, Ticker, TickerEvent, TickerSpec, Trade, TradeEvent,
    TradeHistoryEvent, TradeSide, UserTrade,
};
use crate::ports::exchange::ExchangeConnector;
use crate::ports::market_feed::FeedChannels;

pub struct SimulatedConnector {
    interval: Duration,
}

impl SimulatedConnector {
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub const fn from_config(config: &ExchangeConfig) -> Self {
        Self::new(Duration::from_millis(config.interval_ms))
    }

    /// Price for `spec` at step `seq`: a per-pair anchor plus a saw-tooth.
    pub fn price(spec: &TickerSpec, seq: u64) -> Decimal {
        let anchor: u64 = spec.base.bytes().map(u64::from).sum::<u64>() % 900 + 100;
        Decimal::from(anchor) + Decimal::new(i64::try_from(seq % 50).unwrap_or_default(), 1)
    }

    /// Publish the `seq`-th event for `key`.
    pub fn emit(key: &SubscriptionKey, seq: u64, sink: &FeedChannels) {
        let spec = key.spec.clone();
        let price = Self::price(&spec, seq);
        let tick = Decimal::new(1, 1);
        let now = Utc::now();
        let side = if seq % 2 == 0 { TradeSide::Buy } else { TradeSide::Sell };

        match key.kind {
            DataKind::Ticker => sink.publish_ticker(TickerEvent {
                spec,
                ticker: Ticker {
                    bid: Some(price - tick),
                    ask: Some(price + tick),
                    last: price,
                    volume: Some(Decimal::from(seq)),
                    timestamp: now,
                },
            }),
            DataKind::OrderBook => sink.publish_order_book(OrderBookEvent {
                spec,
                order_book: OrderBook {
                    bids: (1..=5)
                        .map(|i| PriceLevel {
                            price: price - tick * Decimal::from(i),
                            amount: Decimal::from(i),
                        })
                        .collect(),
                    asks: (1..=5)
                        .map(|i| PriceLevel {
                            price: price + tick * Decimal::from(i),
                            amount: Decimal::from(i),
                        })
                        .collect(),
                    timestamp: now,
                },
            }),
            DataKind::Trade => sink.publish_trade(TradeEvent {
                spec,
                trade: Trade {
                    id: seq.to_string(),
                    side,
                    price,
                    amount: Decimal::ONE,
                    timestamp: now,
                },
            }),
            DataKind::UserTradeHistory => sink.publish_user_trades(TradeHistoryEvent {
                trades: vec![UserTrade {
                    id: format!("u{seq}"),
                    order_id: format!("o{}", seq / 3),
                    side,
                    price,
                    amount: Decimal::ONE,
                    fee: Decimal::new(1, 3),
                    fee_currency: spec.counter.clone(),
                    timestamp: now,
                }],
                spec,
            }),
            DataKind::Balance => {
                for currency in [&spec.base, &spec.counter] {
                    sink.publish_balance(BalanceEvent {
                        exchange: spec.exchange.clone(),
                        currency: currency.clone(),
                        balance: Balance {
                            total: Decimal::from(1_000 + seq),
                            available: Decimal::from(900 + seq),
                        },
                    });
                }
            }
            DataKind::OpenOrders => sink.publish_open_orders(OpenOrdersEvent {
                orders: vec![OpenOrder {
                    id: format!("o{}", seq / 3),
                    side,
                    price: price - tick,
                    amount: Decimal::TWO,
                    timestamp: now,
                }],
                spec,
            }),
        }
    }
}

#[async_trait]
impl ExchangeConnector for SimulatedConnector {
    fn exchange(&self) -> &'static str {
        "simulated"
    }

    fn supports(&self, _kind: DataKind) -> bool {
        true
    }

    #[instrument(skip(self, sink), fields(%key))]
    async fn stream(&self, key: &SubscriptionKey, sink: &FeedChannels) -> Result<()> {
        info!(interval_ms = self.interval.as_millis(), "Simulated feed started");
        let mut ticker = tokio::time::interval(self.interval);
        let mut seq = 0_u64;
        loop {
            ticker.tick().await;
            seq += 1;
            Self::emit(key, seq, sink);
        }
    }
}
