//! Push protocol message types.
//!
//! Inbound requests and outbound messages are JSON text frames:
//!
//! ```text
//! -> {"command":"CHANGE_SUBSCRIPTIONS","keys":[{"exchange":"binance","base":"BTC","counter":"USDT","kind":"TICKER"}],"correlationId":"1"}
//! <- {"nature":"TICKER","correlationId":null,"data":{"spec":{...},"ticker":{...}}}
//! <- {"nature":"ERROR","correlationId":"1","data":"Error processing message"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{DataKind, KeyError, MarketEvent, SubscriptionKey};
use crate::ports::market_feed::FeedFailure;

/// Text sent back for any request that could not be handled.
pub const PROCESSING_ERROR: &str = "Error processing message";

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Replace the connection's whole key set.
    ChangeSubscriptions,
}

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub keys: Vec<SubscriptionKey>,
    pub correlation_id: Option<String>,
}

/// A request that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid request: {source}")]
    Malformed {
        /// Recovered from the raw JSON when present.
        correlation_id: Option<String>,
        source: serde_json::Error,
    },
    #[error("invalid key {key}: {source}")]
    InvalidKey {
        correlation_id: Option<String>,
        key: SubscriptionKey,
        source: KeyError,
    },
}

impl DecodeError {
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Malformed { correlation_id, .. } | Self::InvalidKey { correlation_id, .. } => {
                correlation_id.as_deref()
            }
        }
    }
}

/// Decode a request, normalising and validating its keys.
///
/// The correlation id is recovered from any JSON object even when the
/// rest of the request is invalid.
pub fn decode(text: &str) -> Result<Request, DecodeError> {
    let raw: Value = serde_json::from_str(text).map_err(|source| DecodeError::Malformed {
        correlation_id: None,
        source,
    })?;
    let correlation_id = raw
        .get("correlationId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut request: Request =
        serde_json::from_value(raw).map_err(|source| DecodeError::Malformed {
            correlation_id: correlation_id.clone(),
            source,
        })?;

    for key in &mut request.keys {
        *key = key.validated().map_err(|source| DecodeError::InvalidKey {
            correlation_id: correlation_id.clone(),
            key: key.clone(),
            source,
        })?;
    }
    Ok(request)
}

// ============================================================================
// Server -> Client
// ============================================================================

/// What an outbound message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Nature {
    Ticker,
    OrderBook,
    Trade,
    UserTradeHistory,
    Balance,
    OpenOrders,
    Error,
}

impl Nature {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "TICKER",
            Self::OrderBook => "ORDER_BOOK",
            Self::Trade => "TRADE",
            Self::UserTradeHistory => "USER_TRADE_HISTORY",
            Self::Balance => "BALANCE",
            Self::OpenOrders => "OPEN_ORDERS",
            Self::Error => "ERROR",
        }
    }
}

impl From<DataKind> for Nature {
    fn from(kind: DataKind) -> Self {
        match kind {
            DataKind::Ticker => Self::Ticker,
            DataKind::OrderBook => Self::OrderBook,
            DataKind::Trade => Self::Trade,
            DataKind::UserTradeHistory => Self::UserTradeHistory,
            DataKind::Balance => Self::Balance,
            DataKind::OpenOrders => Self::OpenOrders,
        }
    }
}

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub nature: Nature,
    pub correlation_id: Option<String>,
    pub data: Value,
}

impl Outbound {
    /// Event message; `data` is the bare event, the kind is in `nature`.
    pub fn event(event: &MarketEvent) -> serde_json::Result<Self> {
        let data = match event {
            MarketEvent::Ticker(e) => serde_json::to_value(e),
            MarketEvent::OrderBook(e) => serde_json::to_value(e),
            MarketEvent::Trade(e) => serde_json::to_value(e),
            MarketEvent::UserTradeHistory(e) => serde_json::to_value(e),
            MarketEvent::Balance(e) => serde_json::to_value(e),
            MarketEvent::OpenOrders(e) => serde_json::to_value(e),
        }?;
        Ok(Self {
            nature: event.kind().into(),
            correlation_id: None,
            data,
        })
    }

    /// Reply to a request that failed.
    pub fn error(correlation_id: Option<String>) -> Self {
        Self {
            nature: Nature::Error,
            correlation_id,
            data: Value::String(PROCESSING_ERROR.to_string()),
        }
    }

    /// An upstream feed the connection depends on failed.
    pub fn feed_failure(failure: &FeedFailure) -> Self {
        Self {
            nature: Nature::Error,
            correlation_id: None,
            data: Value::String(failure.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and already-built `Value`s: serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
