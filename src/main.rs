//! Market Event Bus - Entry Point
//!
//! Wires the upstream feed hub, the subscription registry and the push
//! endpoint, then runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config.toml (path from argv[1] or MARKET_BUS_CONFIG) + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Build exchange connectors for the enabled exchanges
//! 4. Create StreamingFeedHub (implements FeedProvider port)
//! 5. Create SubscriptionRegistry on top of the hub
//! 6. Spawn health server (/live + /ready)
//! 7. Spawn Prometheus metrics server (sampled from registry + hub)
//! 8. Spawn config watcher and the watchlist subscriber
//! 9. Spawn WebSocket push server on /ws
//! 10. Wait for SIGINT → graceful shutdown (drain→close→exit)

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use market_event_bus::adapters::feeds::{ConnectorRegistry, StreamingFeedHub};
use market_event_bus::adapters::metrics::{HealthServer, HealthState, MetricsRegistry};
use market_event_bus::adapters::ws::{self, AppState};
use market_event_bus::config::{self, hot_reload::ConfigWatcher};
use market_event_bus::usecases::{SubscriptionRegistry, Watchlist};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MARKET_BUS_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = config::loader::load_config(&config_path)
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(&config.service.log_level)
                }),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        exchanges = config.enabled_exchanges().count(),
        watchlist = config.watchlist.len(),
        "Starting market event bus"
    );

    // ── 3. Shutdown signal channel ──────────────────────────
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);

    // ── 4. Exchange connectors + feed hub ───────────────────
    let connectors = ConnectorRegistry::from_config(config.enabled_exchanges())
        .context("Failed to build exchange connectors")?;
    info!(connectors = ?connectors.names(), "Exchange connectors ready");

    let hub = Arc::new(
        StreamingFeedHub::new(connectors, &config.feeds)
            .context("Failed to create feed hub")?,
    );

    // ── 5. Subscription registry ────────────────────────────
    let registry = Arc::new(SubscriptionRegistry::new(hub.clone()));

    // ── 6. Health server ────────────────────────────────────
    let health = Arc::new(HealthState::new());
    let health_server = HealthServer::new(Arc::clone(&health), config.metrics.health_port);
    let health_handle = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = health_server.run(shutdown_rx).await {
                error!(error = %e, "Health server failed");
            }
        }
    });

    // ── 7. Prometheus metrics ───────────────────────────────
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics")?);
        let sample_registry = Arc::clone(&registry);
        let sample_hub = Arc::clone(&hub);
        let sample = move |metrics: &MetricsRegistry| {
            match (sample_registry.stats(), sample_hub.stats()) {
                (Ok(registry), Ok(hub)) => metrics.observe(registry, hub),
                (Err(e), _) => warn!(error = %e, "Registry stats unavailable"),
                (_, Err(e)) => warn!(error = %e, "Hub stats unavailable"),
            }
        };
        let serve = Arc::clone(&metrics).serve(
            config.metrics.bind_address.clone(),
            sample,
            shutdown_tx.subscribe(),
        );
        tokio::spawn(async move {
            if let Err(e) = serve.await {
                error!(error = %e, "Metrics server failed");
            }
        });
        Some(metrics)
    } else {
        None
    };

    // ── 8. Config watcher + watchlist subscriber ────────────
    let (mut watcher, config_rx) = ConfigWatcher::new(&config_path, config.clone());
    let watcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = watcher.run(shutdown_rx).await {
                error!(error = %e, "Config watcher failed");
            }
        }
    });

    let mut watchlist = Watchlist::new(Arc::clone(&registry), config_rx, shutdown_tx.subscribe());
    let watchlist_handle = tokio::spawn(async move {
        if let Err(e) = watchlist.run().await {
            error!(error = %e, "Watchlist failed");
        }
    });

    // ── 9. WebSocket push server ────────────────────────────
    let state = AppState {
        registry: Arc::clone(&registry),
        metrics,
        shutdown: shutdown_tx.clone(),
    };
    let push_handle = tokio::spawn({
        let bind_address = config.service.bind_address.clone();
        let health = Arc::clone(&health);
        async move {
            if let Err(e) = ws::server::serve(bind_address, state, health).await {
                error!(error = %e, "Push server failed");
            }
        }
    });

    info!("All tasks spawned, bus is running");

    // ── 10. Wait for SIGINT ─────────────────────────────────
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for SIGINT");
    }
    info!("SIGINT received, initiating graceful shutdown");

    // Readiness probe → 503 before connections close
    health.mark_draining();
    let _ = shutdown_tx.send(());

    let grace = Duration::from_secs(config.service.shutdown_grace_secs);
    if tokio::time::timeout(grace, async {
        let _ = push_handle.await;
        let _ = watchlist_handle.await;
        let _ = watcher_handle.await;
    })
    .await
    .is_err()
    {
        warn!(grace_secs = grace.as_secs(), "Tasks still running after grace period");
    }
    health_handle.abort();

    match (registry.stats(), hub.stats()) {
        (Ok(registry), Ok(hub)) => info!(
            subscribers = registry.subscribers,
            active_feeds = hub.active_feeds,
            "Shutdown complete"
        ),
        _ => info!("Shutdown complete"),
    }
    Ok(())
}
