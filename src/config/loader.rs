//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;
use crate::adapters::feeds::connectors;

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    exchanges = config.enabled_exchanges().count(),
    watchlist = config.watchlist.len(),
    capacity = config.feeds.channel_capacity,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig = toml::from_str(content).context("Failed to parse config.toml")?;
  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Positive channel sizes and delays
/// - Known, unique exchange names
/// - Watchlist entries that form valid keys on enabled exchanges
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(!config.service.name.is_empty(), "Service name must not be empty");

  anyhow::ensure!(
    config.feeds.channel_capacity > 0,
    "feeds.channel_capacity must be positive"
  );
  anyhow::ensure!(
    config.feeds.reconnect_delay_ms > 0,
    "feeds.reconnect_delay_ms must be positive"
  );

  let mut seen = HashSet::new();
  for exchange in &config.exchanges {
    anyhow::ensure!(
      connectors::is_known(&exchange.name),
      "Unknown exchange '{}' (known: {})",
      exchange.name,
      connectors::known_names().join(", ")
    );
    anyhow::ensure!(
      seen.insert(exchange.name.as_str()),
      "Exchange '{}' configured twice",
      exchange.name
    );
    anyhow::ensure!(
      exchange.interval_ms > 0,
      "Exchange '{}' interval_ms must be positive",
      exchange.name
    );
  }

  let enabled: HashSet<&str> = config.enabled_exchanges().map(|e| e.name.as_str()).collect();
  for (i, entry) in config.watchlist.iter().enumerate() {
    let spec = entry.spec();
    spec
      .validate()
      .with_context(|| format!("Watchlist entry {i} ({spec}) is invalid"))?;
    anyhow::ensure!(
      enabled.contains(spec.exchange.as_str()),
      "Watchlist entry {} ({}) references a disabled or unknown exchange",
      i,
      spec
    );
    anyhow::ensure!(!entry.kinds.is_empty(), "Watchlist entry {} ({}) has no kinds", i, spec);
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{DataKind, SubscriptionKey, TickerSpec};

  const MINIMAL: &str = r#"
[service]
name = "bus"

[[exchanges]]
name = "simulated"
interval_ms = 250

[[watchlist]]
exchange = "simulated"
base = "btc"
counter = "usd"
kinds = ["TICKER", "TRADE"]
"#;

  #[test]
  fn test_load_nonexistent_file() {
    let result = load_config("nonexistent.toml");
    assert!(result.is_err());
  }

  #[test]
  fn test_defaults_and_watchlist_keys() {
    let config = parse_config(MINIMAL).unwrap();
    assert_eq!(config.service.log_level, "info");
    assert_eq!(config.feeds.channel_capacity, 1024);
    assert!(config.metrics.enabled);

    let spec = TickerSpec::new("simulated", "BTC", "USD");
    let keys = config.watchlist_keys();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&SubscriptionKey::new(spec.clone(), DataKind::Trade)));
    assert!(keys.contains(&SubscriptionKey::ticker(spec)));
  }

  #[test]
  fn test_rejects_unknown_exchange() {
    let text = MINIMAL.replace("name = \"simulated\"", "name = \"kraken\"");
    let err = parse_config(&text).unwrap_err();
    assert!(format!("{err:#}").contains("Unknown exchange 'kraken'"));
  }

  #[test]
  fn test_rejects_watchlist_on_disabled_exchange() {
    let text = MINIMAL.replace("interval_ms = 250", "interval_ms = 250\nenabled = false");
    assert!(parse_config(&text).is_err());
  }

  #[test]
  fn test_rejects_zero_capacity() {
    let text = format!("{MINIMAL}\n[feeds]\nchannel_capacity = 0\n");
    assert!(parse_config(&text).is_err());
  }
}
