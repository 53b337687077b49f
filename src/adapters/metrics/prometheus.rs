//! Prometheus Metrics Registry - Bus Observability
//!
//! Registers and exposes Prometheus metrics for Grafana dashboards:
//! subscriber and feed counts sampled from the registry and hub on each
//! scrape, plus push connection counters updated as they happen.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::adapters::feeds::HubStats;
use crate::usecases::RegistryStats;

/// Centralized Prometheus metrics for the bus.
///
/// All metrics follow the naming convention `market_bus_*`.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Subscribers holding at least one key.
    pub subscribers: IntGauge,
    /// Distinct keys with at least one holder.
    pub required_keys: IntGauge,
    /// Provider notifications since start.
    pub provider_notifications: IntGauge,
    /// Single-key callback handles alive.
    pub live_handles: IntGauge,
    /// Upstream feed tasks running.
    pub active_feeds: IntGauge,
    /// Upstream feed failures since start.
    pub feed_failures: IntGauge,
    /// Open push connections.
    pub ws_connections: IntGauge,
    /// Outbound push messages by nature.
    pub ws_messages: IntCounterVec,
    /// Inbound push requests answered with ERROR.
    pub ws_request_errors: IntCounter,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let subscribers = IntGauge::new(
            "market_bus_subscribers",
            "Subscribers holding at least one subscription key",
        )?;
        let required_keys = IntGauge::new(
            "market_bus_required_keys",
            "Distinct subscription keys with at least one holder",
        )?;
        let provider_notifications = IntGauge::new(
            "market_bus_provider_notifications",
            "Required key set changes pushed to the feed provider",
        )?;
        let live_handles = IntGauge::new(
            "market_bus_live_handles",
            "Single-key callback handles alive",
        )?;
        let active_feeds = IntGauge::new(
            "market_bus_active_feeds",
            "Upstream feed tasks running",
        )?;
        let feed_failures = IntGauge::new(
            "market_bus_feed_failures",
            "Upstream feed failures since start",
        )?;
        let ws_connections = IntGauge::new(
            "market_bus_ws_connections",
            "Open WebSocket push connections",
        )?;
        let ws_messages = IntCounterVec::new(
            Opts::new("market_bus_ws_messages_total", "Outbound push messages"),
            &["nature"],
        )?;
        let ws_request_errors = IntCounter::new(
            "market_bus_ws_request_errors_total",
            "Inbound push requests answered with ERROR",
        )?;

        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(required_keys.clone()))?;
        registry.register(Box::new(provider_notifications.clone()))?;
        registry.register(Box::new(live_handles.clone()))?;
        registry.register(Box::new(active_feeds.clone()))?;
        registry.register(Box::new(feed_failures.clone()))?;
        registry.register(Box::new(ws_connections.clone()))?;
        registry.register(Box::new(ws_messages.clone()))?;
        registry.register(Box::new(ws_request_errors.clone()))?;

        Ok(Self {
            registry,
            subscribers,
            required_keys,
            provider_notifications,
            live_handles,
            active_feeds,
            feed_failures,
            ws_connections,
            ws_messages,
            ws_request_errors,
        })
    }

    /// Copy registry and hub counters into the gauges.
    pub fn observe(&self, registry: RegistryStats, hub: HubStats) {
        self.subscribers.set(gauge(registry.subscribers));
        self.required_keys.set(gauge(registry.required_keys));
        self.provider_notifications
            .set(i64::try_from(registry.notifications).unwrap_or(i64::MAX));
        self.live_handles.set(gauge(registry.live_handles));
        self.active_feeds.set(gauge(hub.active_feeds));
        self.feed_failures
            .set(i64::try_from(hub.failures).unwrap_or(i64::MAX));
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics are not UTF-8")
    }

    /// Serve Prometheus metrics on `bind_address`.
    ///
    /// `sample` runs before every scrape to refresh sampled gauges.
    #[instrument(skip(self, sample, shutdown_rx))]
    pub async fn serve<F>(
        self: Arc<Self>,
        bind_address: String,
        sample: F,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()>
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        let metrics_self = Arc::clone(&self);
        let sample = Arc::new(sample);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                let sample = Arc::clone(&sample);
                async move {
                    sample(&metrics);
                    metrics.render().unwrap_or_else(|e| {
                        warn!(error = %e, "Metrics scrape failed");
                        String::new()
                    })
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

fn gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_render() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.observe(
            RegistryStats {
                subscribers: 3,
                required_keys: 2,
                notifications: 7,
                live_handles: 1,
            },
            HubStats {
                active_feeds: 2,
                failures: 4,
                attempts: 9,
            },
        );
        metrics.ws_messages.with_label_values(&["TICKER"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("market_bus_subscribers 3"));
        assert!(text.contains("market_bus_feed_failures 4"));
        assert!(text.contains("market_bus_ws_messages_total{nature=\"TICKER\"} 1"));
    }
}
