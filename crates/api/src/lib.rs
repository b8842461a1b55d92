//! HTTP API server for the transactional outbox.
//!
//! Hosts the demo order endpoints that write through the outbox, endpoints to
//! inspect and replay outbox rows, and the message relay itself, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod orders;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox_store::TransactionalStore;
use relay::{MessageBroker, MessageRelay, RelayConfig};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use orders::OrderService;
use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/outbox/stats", get(routes::outbox::stats))
        .route("/outbox/messages", get(routes::outbox::list))
        .route("/outbox/messages/{id}", get(routes::outbox::get))
        .route("/outbox/messages/{id}/replay", post(routes::outbox::replay))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the order service and relay around a store and broker.
///
/// The relay is created stopped; call `start` on it to begin publishing.
pub fn create_state(
    store: Arc<dyn TransactionalStore>,
    broker: Arc<dyn MessageBroker>,
    relay_config: RelayConfig,
) -> Arc<AppState> {
    let order_service = OrderService::new(store.clone(), relay_config.retry.clone());
    let relay = Arc::new(MessageRelay::new(store.clone(), broker, relay_config));
    Arc::new(AppState {
        order_service,
        store,
        relay,
    })
}

/// Deletes published rows processed more than `retention` ago.
pub async fn purge_expired(
    store: &dyn TransactionalStore,
    retention: Duration,
) -> outbox_store::Result<u64> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = store
        .now()
        .checked_sub_signed(retention)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
    let purged = store.purge_published(cutoff).await?;
    if purged > 0 {
        tracing::info!(purged, %cutoff, "purged published outbox rows");
    }
    Ok(purged)
}

/// Rolls back transactions left open longer than `max_age`.
pub async fn abandon_stale_transactions(
    store: &dyn TransactionalStore,
    max_age: Duration,
) -> outbox_store::Result<usize> {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let cutoff = store
        .now()
        .checked_sub_signed(max_age)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
    store.abandon_stale_transactions(cutoff).await
}

/// Runs `purge_expired` and `abandon_stale_transactions` every `interval`
/// until `token` is cancelled.
pub async fn run_retention(
    store: Arc<dyn TransactionalStore>,
    retention: Duration,
    transaction_max_age: Duration,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = purge_expired(store.as_ref(), retention).await {
            tracing::error!(error = %e, "outbox retention pass failed");
        }
        if let Err(e) = abandon_stale_transactions(store.as_ref(), transaction_max_age).await {
            tracing::error!(error = %e, "abandoned transaction sweep failed");
        }
    }
}
