//! Connector table - exchange name to connector constructor
//!
//! Connectors are chosen by name at startup from a fixed table; adding an
//! exchange means adding a row here.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::binance::BinanceConnector;
use super::coinbase::CoinbaseConnector;
use super::simulated::SimulatedConnector;
use crate::config::ExchangeConfig;
use crate::ports::exchange::ExchangeConnector;

type Constructor = fn(&ExchangeConfig) -> Arc<dyn ExchangeConnector>;

fn binance(config: &ExchangeConfig) -> Arc<dyn ExchangeConnector> {
    Arc::new(BinanceConnector::from_config(config))
}

fn coinbase(config: &ExchangeConfig) -> Arc<dyn ExchangeConnector> {
    Arc::new(CoinbaseConnector::from_config(config))
}

fn simulated(config: &ExchangeConfig) -> Arc<dyn ExchangeConnector> {
    Arc::new(SimulatedConnector::from_config(config))
}

const CONSTRUCTORS: &[(&str, Constructor)] = &[
    ("binance", binance),
    ("coinbase", coinbase),
    ("simulated", simulated),
];

/// Whether `name` has a constructor.
pub fn is_known(name: &str) -> bool {
    CONSTRUCTORS.iter().any(|(known, _)| *known == name)
}

/// All constructible exchange names.
pub fn known_names() -> Vec<&'static str> {
    CONSTRUCTORS.iter().map(|(name, _)| *name).collect()
}

/// Build a connector for `config.name`.
pub fn build(config: &ExchangeConfig) -> Result<Arc<dyn ExchangeConnector>> {
    let (_, constructor) = CONSTRUCTORS
        .iter()
        .find(|(name, _)| *name == config.name)
        .with_context(|| format!("No connector named '{}'", config.name))?;
    Ok(constructor(config))
}

/// Connectors available to the feed hub, keyed by exchange name.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    by_name: BTreeMap<String, Arc<dyn ExchangeConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a connector for every enabled exchange.
    pub fn from_config<'a>(exchanges: impl IntoIterator<Item = &'a ExchangeConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for exchange in exchanges {
            registry.register(build(exchange)?);
        }
        info!(exchanges = ?registry.names(), "Exchange connectors ready");
        Ok(registry)
    }

    /// Add or replace the connector for its exchange.
    pub fn register(&mut self, connector: Arc<dyn ExchangeConnector>) {
        self.by_name.insert(connector.exchange().to_string(), connector);
    }

    pub fn get(&self, exchange: &str) -> Option<Arc<dyn ExchangeConnector>> {
        self.by_name.get(exchange).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DataKind;

    fn exchange(name: &str) -> ExchangeConfig {
        ExchangeConfig {
            name: name.to_string(),
            enabled: true,
            ws_url: None,
            interval_ms: 100,
        }
    }

    #[test]
    fn test_builds_every_known_exchange() {
        for name in known_names() {
            let connector = build(&exchange(name)).unwrap();
            assert_eq!(connector.exchange(), name);
            assert!(connector.supports(DataKind::Ticker));
        }
    }

    #[test]
    fn test_unknown_name_is_error() {
        assert!(!is_known("kraken"));
        assert!(build(&exchange("kraken")).is_err());
    }

    #[test]
    fn test_registry_from_config() {
        let configs = [exchange("simulated"), exchange("binance")];
        let registry = ConnectorRegistry::from_config(&configs).unwrap();
        assert_eq!(registry.names(), vec!["binance", "simulated"]);
        assert!(registry.get("coinbase").is_none());
    }
}
