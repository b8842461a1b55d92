//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use outbox_store::StoreError;
use relay::RelayError;

use crate::orders::OrderError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Order validation or persistence error.
    Order(OrderError),
    /// Outbox store error.
    Store(StoreError),
    /// Relay error.
    Relay(RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Order(OrderError::Store(err)) | ApiError::Store(err) => {
                store_error_to_response(err)
            }
            ApiError::Order(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Relay(RelayError::Store(err)) => store_error_to_response(err),
            ApiError::Relay(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn store_error_to_response(err: StoreError) -> (StatusCode, String) {
    match &err {
        StoreError::MessageNotFound(_) | StoreError::TransactionNotFound(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        StoreError::InvalidWrite(_) | StoreError::InvalidPartition { .. } => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        StoreError::DuplicateMessage(_)
        | StoreError::NotDeadLettered { .. }
        | StoreError::InvalidTransition { .. }
        | StoreError::TerminalState { .. }
        | StoreError::ConcurrencyConflict { .. }
        | StoreError::TransactionAborted { .. } => (StatusCode::CONFLICT, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        ApiError::Order(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::Relay(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_store::{MessageId, OutboxStatus};

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn store_errors_map_to_http_codes() {
        let id = MessageId::new();
        assert_eq!(
            status_of(StoreError::MessageNotFound(id).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                StoreError::NotDeadLettered {
                    id,
                    status: OutboxStatus::Pending
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::InvalidWrite("empty".into()).into()),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn order_validation_is_bad_request() {
        assert_eq!(
            status_of(OrderError::NoItems.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrderError::TotalOverflow.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrderError::Store(StoreError::MessageNotFound(MessageId::new())).into()),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn relay_lifecycle_errors_are_unavailable() {
        assert_eq!(
            status_of(RelayError::NotRunning.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
