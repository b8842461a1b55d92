//! Order endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{AggregateId, CorrelationId};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::orders::{Order, OrderItem};
use crate::routes::AppState;

/// Request header whose value becomes the outbox message's correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Retries carrying the same key get the first order back.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Option<String>,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderCreatedResponse {
    pub order_id: String,
    pub correlation_id: String,
    pub total_cents: i64,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// -- Handlers --

/// POST /orders: store an order and enqueue its `OrderCreated` event.
///
/// With an `Idempotency-Key` header, a repeat of an earlier request answers
/// 200 with the original order instead of creating another.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderCreatedResponse>), ApiError> {
    let correlation_id = header_str(&headers, CORRELATION_ID_HEADER)
        .map(CorrelationId::from)
        .unwrap_or_else(CorrelationId::generate);
    let idempotency_key = header_str(&headers, IDEMPOTENCY_KEY_HEADER);

    let customer_id = req
        .customer_id
        .unwrap_or_else(|| AggregateId::new().to_string());
    let items = req
        .items
        .into_iter()
        .map(|item| OrderItem {
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price_cents: item.unit_price_cents,
        })
        .collect();

    let (status, order) = match idempotency_key {
        Some(key) => {
            let creation = state
                .order_service
                .create_order_idempotent(key, customer_id, items, correlation_id.clone())
                .await?;
            let status = if creation.is_new() {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, creation.order().clone())
        }
        None => {
            let order = state
                .order_service
                .create_order(customer_id, items, correlation_id.clone())
                .await?;
            (StatusCode::CREATED, order)
        }
    };

    Ok((
        status,
        Json(OrderCreatedResponse {
            order_id: order.id.to_string(),
            correlation_id: correlation_id.to_string(),
            total_cents: order.total_cents,
        }),
    ))
}

/// GET /orders/:id: load an order row.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id: AggregateId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;

    let order = state
        .order_service
        .get_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(order))
}
