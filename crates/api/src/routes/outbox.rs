//! Outbox inspection and dead-letter replay endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::AggregateId;
use outbox_store::{MessageId, OutboxMessage, OutboxQuery, OutboxStatus, TransactionalStoreExt};
use relay::OutboxStats;
use serde::Deserialize;

use crate::error::ApiError;
use crate::routes::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListParams {
    fn into_query(self) -> Result<OutboxQuery, ApiError> {
        let mut query = OutboxQuery::new()
            .limit(self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT))
            .offset(self.offset.unwrap_or(0));

        if let Some(status) = self.status {
            let status: OutboxStatus = status
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("Unknown status '{status}'")))?;
            query = query.status(status);
        }
        if let Some(aggregate_id) = self.aggregate_id {
            let aggregate_id: AggregateId = aggregate_id
                .parse()
                .map_err(|e| ApiError::BadRequest(format!("Invalid aggregate_id: {e}")))?;
            query = query.aggregate_id(aggregate_id);
        }
        if let Some(event_type) = self.event_type {
            query = query.event_type(event_type);
        }
        Ok(query)
    }
}

fn parse_message_id(id: &str) -> Result<MessageId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}

/// GET /outbox/stats: relay counters and row breakdown.
#[tracing::instrument(skip(state))]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<OutboxStats>, ApiError> {
    Ok(Json(state.relay.get_stats().await?))
}

/// GET /outbox/messages: filter outbox rows, oldest first.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<OutboxMessage>>, ApiError> {
    let query = params.into_query()?;
    Ok(Json(state.store.query_outbox(query).await?))
}

/// GET /outbox/messages/:id: a single outbox row.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OutboxMessage>, ApiError> {
    let message_id = parse_message_id(&id)?;
    let message = state
        .store
        .get_outbox_message(message_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Outbox message {id} not found")))?;
    Ok(Json(message))
}

/// POST /outbox/messages/:id/replay: re-enqueue a dead message as a new one.
#[tracing::instrument(skip(state))]
pub async fn replay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<OutboxMessage>), ApiError> {
    let message_id = parse_message_id(&id)?;
    let replayed = state.store.replay_dead_letter(message_id).await?;
    tracing::info!(dead_id = %message_id, replay_id = %replayed.id(), "dead letter replayed");
    Ok((StatusCode::CREATED, Json(replayed)))
}
