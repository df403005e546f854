//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ledger::LedgerError;
use orders::OrderError;
use outbox::OutboxError;
use saga::{FailureKind, SagaError};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga or store error.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    // Client-shaped order errors are bad requests, not server faults.
    if let SagaError::Order(
        OrderError::EmptyOrder | OrderError::InvalidQuantity { .. },
    ) = &err
    {
        return (StatusCode::BAD_REQUEST, err.to_string());
    }
    if let SagaError::Ledger(LedgerError::InvalidAmount(_)) = &err {
        return (StatusCode::BAD_REQUEST, err.to_string());
    }

    match err.kind() {
        FailureKind::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
        FailureKind::Conflict => (StatusCode::CONFLICT, err.to_string()),
        FailureKind::Transient => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        FailureKind::Fatal => {
            tracing::error!(error = %err, "saga error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        ApiError::Saga(SagaError::Order(err))
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Saga(SagaError::Ledger(err))
    }
}

impl From<OutboxError> for ApiError {
    fn from(err: OutboxError) -> Self {
        ApiError::Saga(SagaError::Outbox(err))
    }
}
