//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::routes::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub relay_running: bool,
    /// Pending rows, or `None` if the store could not be reached.
    pub pending: Option<u64>,
}

/// GET /health: 200 when the store answers, 503 otherwise.
pub async fn check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let relay_running = state.relay.is_running().await;
    match state.store.status_counts().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                relay_running,
                pending: Some(counts.pending),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    relay_running,
                    pending: None,
                }),
            )
        }
    }
}
