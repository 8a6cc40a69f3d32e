//! Service error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the demo service handlers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid customer id format: {0}")]
    InvalidCustomerId(String),

    #[error("customer not found: {0}")]
    CustomerNotFound(String),

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ServiceError::InvalidCustomerId(id) => (
                StatusCode::BAD_REQUEST,
                "INVALID_CUSTOMER_ID",
                format!("invalid customer id format: '{}'", id),
            ),
            ServiceError::CustomerNotFound(id) => (
                StatusCode::NOT_FOUND,
                "CUSTOMER_NOT_FOUND",
                format!("customer '{}' not found", id),
            ),
            ServiceError::Upstream(msg) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_FAILED", msg.clone())
            }
            ServiceError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Payment validation failure raised on the deepest span of the payment
/// chain. Recorded on the span as an exception, then handled gracefully —
/// it never propagates out of the payment flow as an HTTP error.
#[derive(Debug, Error)]
#[error("payment validation failed for order {order_id}: {reason}")]
pub struct PaymentFailedError {
    /// Order the payment belonged to.
    pub order_id: String,
    /// Synthetic payment id (`pay_<order_id>`).
    pub payment_id: String,
    /// Failure reason (e.g. `insufficient_funds`).
    pub reason: String,
}
