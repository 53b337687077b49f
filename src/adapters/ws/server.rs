//! WebSocket push server using Axum.
//!
//! `/ws` upgrades to a push connection backed by a `PushSession`. A
//! writer task drains the connection's bounded outbound queue and sends
//! a keepalive ping every 30 seconds; the reader loop feeds inbound text
//! frames to the session until the peer leaves or shutdown starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use super::protocol::Outbound;
use super::session::PushSession;
use crate::adapters::metrics::{HealthState, MetricsRegistry};
use crate::usecases::SubscriptionRegistry;

/// Outbound messages a slow peer may have queued before forwarders wait.
const OUTBOUND_CAPACITY: usize = 256;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SubscriptionRegistry>,
    pub metrics: Option<Arc<MetricsRegistry>>,
    /// Closes every open connection.
    pub shutdown: broadcast::Sender<()>,
}

/// Create the push router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Bind `bind_address` and serve push connections until shutdown.
#[instrument(skip(state, health))]
pub async fn serve(bind_address: String, state: AppState, health: Arc<HealthState>) -> anyhow::Result<()> {
    let mut shutdown_rx = state.shutdown.subscribe();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind push endpoint on {bind_address}"))?;

    info!(address = %bind_address, "Push server started");
    health.mark_accepting();

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Run one push connection to completion.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    let mut session = PushSession::new(Arc::clone(&state.registry), tx.clone());
    let subscriber = session.id().to_string();
    if let Some(metrics) = &state.metrics {
        metrics.ws_connections.inc();
    }
    info!(%subscriber, "Push connection opened");

    let writer_metrics = state.metrics.clone();
    let writer = tokio::spawn(async move {
        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if let Some(metrics) = &writer_metrics {
                        metrics.ws_messages.with_label_values(&[message.nature.as_str()]).inc();
                    }
                    if ws_tx.send(Message::Text(message.to_json())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut shutdown_rx = state.shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(%subscriber, "Closing push connection for shutdown");
                break;
            }
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(%subscriber, error = %e, "WebSocket error");
                        break;
                    }
                };
                if let Some(reply) = session.handle_text(&text) {
                    if let Some(metrics) = &state.metrics {
                        metrics.ws_request_errors.inc();
                    }
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    session.close();
    drop(tx);
    writer.abort();

    if let Some(metrics) = &state.metrics {
        metrics.ws_connections.dec();
    }
    info!(%subscriber, "Push connection closed");
}
