//! Config Hot-Reload - Watch config.toml for Changes Every 60s
//!
//! Periodically re-reads config.toml and compares it with the last
//! version seen. If it changed and still validates, the new config is
//! published on a `tokio::sync::watch` channel. The watchlist subscriber
//! follows it without a restart.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::AppConfig;

/// Watches config.toml for changes and broadcasts updates.
///
/// Polls the file instead of using a filesystem watcher, which behaves
/// differently across Linux/macOS/Docker volumes.
pub struct ConfigWatcher {
    /// Path to config.toml.
    config_path: String,
    /// Watch channel sender for config updates.
    config_tx: watch::Sender<AppConfig>,
    /// Hash of the file contents last loaded.
    last_hash: Option<u64>,
    /// Poll period.
    interval: Duration,
}

impl ConfigWatcher {
    /// Create a new config watcher polling every 60 seconds.
    ///
    /// Returns the watcher and a receiver consumers use to get notified
    /// of config changes.
    pub fn new(config_path: &str, initial_config: AppConfig) -> (Self, watch::Receiver<AppConfig>) {
        Self::with_interval(config_path, initial_config, Duration::from_secs(60))
    }

    pub fn with_interval(
        config_path: &str,
        initial_config: AppConfig,
        interval: Duration,
    ) -> (Self, watch::Receiver<AppConfig>) {
        let (config_tx, config_rx) = watch::channel(initial_config);

        let watcher = Self {
            config_path: config_path.to_string(),
            config_tx,
            last_hash: None,
            interval,
        };

        (watcher, config_rx)
    }

    /// Run the config watcher loop until shutdown.
    #[instrument(skip(self, shutdown_rx), fields(path = %self.config_path))]
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Config watcher started");

        self.last_hash = self.compute_hash().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Config watcher shutting down");
                    return Ok(());
                }
                () = tokio::time::sleep(self.interval) => {
                    self.check_and_reload().await;
                }
            }
        }
    }

    /// Reload if the file contents changed.
    async fn check_and_reload(&mut self) {
        let new_hash = self.compute_hash().await;

        if new_hash == self.last_hash {
            debug!("Config unchanged");
            return;
        }

        info!("Config change detected, reloading");

        match super::loader::load_config(&self.config_path) {
            Ok(new_config) => {
                self.last_hash = new_hash;
                let changed = self.config_tx.send_if_modified(|current| {
                    if *current == new_config {
                        return false;
                    }
                    *current = new_config;
                    true
                });
                if changed {
                    info!(receivers = self.config_tx.receiver_count(), "Config reloaded");
                } else {
                    debug!("Config file changed but settings are identical");
                }
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to reload config, keeping current");
            }
        }
    }

    async fn compute_hash(&self) -> Option<u64> {
        let content = tokio::fs::read_to_string(&self.config_path).await.ok()?;

        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Some(hasher.finish())
    }
}
