//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml`. Exchange
//! endpoints, channel sizes and the background watchlist all live here;
//! nothing about a venue is hardcoded in the domain layer.

pub mod hot_reload;
pub mod loader;

use std::collections::HashSet;

use serde::Deserialize;

use crate::domain::{DataKind, SubscriptionKey, TickerSpec};

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
  /// Service identity and listeners.
  pub service: ServiceConfig,
  /// Merged stream and reconnect tuning.
  #[serde(default)]
  pub feeds: FeedsConfig,
  /// Upstream exchanges the hub may connect to.
  #[serde(default)]
  pub exchanges: Vec<ExchangeConfig>,
  /// Metrics and health endpoints.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Keys held by the built-in background subscriber.
  #[serde(default)]
  pub watchlist: Vec<WatchlistEntry>,
}

/// Service identity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable service name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// WebSocket push endpoint bind address.
  #[serde(default = "default_bind_address")]
  pub bind_address: String,
  /// Seconds to wait for tasks after the shutdown signal.
  #[serde(default = "default_shutdown_grace")]
  pub shutdown_grace_secs: u64,
}

/// Feed hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedsConfig {
  /// Slots per merged broadcast stream.
  #[serde(default = "default_channel_capacity")]
  pub channel_capacity: usize,
  /// Delay before reopening a dropped or failed upstream feed.
  #[serde(default = "default_reconnect_delay")]
  pub reconnect_delay_ms: u64,
}

impl Default for FeedsConfig {
  fn default() -> Self {
    Self {
      channel_capacity: default_channel_capacity(),
      reconnect_delay_ms: default_reconnect_delay(),
    }
  }
}

/// One upstream exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeConfig {
  /// Connector name (`binance`, `coinbase`, `simulated`).
  pub name: String,
  /// Disabled exchanges are not registered with the hub.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Override the connector's default WebSocket endpoint.
  pub ws_url: Option<String>,
  /// Tick interval for the simulated connector.
  #[serde(default = "default_interval")]
  pub interval_ms: u64,
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

/// Instrument watched by the background subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchlistEntry {
  pub exchange: String,
  pub base: String,
  pub counter: String,
  /// Data kinds to hold; tickers only when omitted.
  #[serde(default = "default_watch_kinds")]
  pub kinds: Vec<DataKind>,
}

impl WatchlistEntry {
  pub fn spec(&self) -> TickerSpec {
    TickerSpec::new(&self.exchange, &self.base, &self.counter)
  }
}

impl AppConfig {
  /// Every key named by the watchlist.
  pub fn watchlist_keys(&self) -> HashSet<SubscriptionKey> {
    self
      .watchlist
      .iter()
      .flat_map(|entry| {
        let spec = entry.spec();
        entry
          .kinds
          .iter()
          .map(move |kind| SubscriptionKey::new(spec.clone(), *kind))
      })
      .collect()
  }

  /// Enabled exchanges only.
  pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
    self.exchanges.iter().filter(|e| e.enabled)
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_bind_address() -> String {
  "0.0.0.0:8000".to_string()
}

fn default_shutdown_grace() -> u64 {
  5
}

fn default_channel_capacity() -> usize {
  1024
}

fn default_reconnect_delay() -> u64 {
  5_000
}

fn default_true() -> bool {
  true
}

fn default_interval() -> u64 {
  1_000
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}

fn default_watch_kinds() -> Vec<DataKind> {
  vec![DataKind::Ticker]
}
