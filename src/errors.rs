use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::gateway::GatewayError;

/// Message shown to callers for any gateway failure. Provider diagnostics stay in the logs.
pub const GATEWAY_FAILURE_MESSAGE: &str = "payment could not be processed, please retry";

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Conflict")
    pub error: String,
    /// Machine readable error kind (e.g. "state_conflict")
    pub code: String,
    /// Human readable description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

/// Closed set of failure categories the HTTP boundary maps to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input shape; never retried by the system.
    Validation,
    NotFound,
    /// Illegal transition, duplicate, insufficient stock. Refresh and retry with new data.
    StateConflict,
    /// External provider failure or timeout.
    Gateway,
    /// A broken internal invariant. Always a bug.
    Invariant,
    Unauthorized,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::Gateway => "gateway_error",
            ErrorKind::Invariant => "invariant_violation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::Gateway => StatusCode::BAD_GATEWAY,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Invariant | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Product {0} is no longer available")]
    ProductUnavailable(Uuid),

    #[error(
        "Insufficient stock for '{product_name}' ({product_id}): requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: Uuid,
        product_name: String,
        available: i32,
        requested: i32,
    },

    #[error("Order {order_id} can no longer be modified (status {status})")]
    OrderNotModifiable { order_id: Uuid, status: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Order {order_id} is not payable (status {status})")]
    OrderNotPayable { order_id: Uuid, status: String },

    #[error("Return window of {window_days} days has expired for order {order_id}")]
    ReturnWindowExpired { order_id: Uuid, window_days: i64 },

    #[error("Order {order_id} is not returnable (status {status})")]
    OrderNotReturnable { order_id: Uuid, status: String },

    #[error("An active return already exists for order item {0}")]
    DuplicateReturn(Uuid),

    #[error("Return {0} has already been refunded")]
    AlreadyRefunded(Uuid),

    #[error("No completed payment exists for order {0}")]
    NoCompletedPayment(Uuid),

    #[error("Payment {0} has no capture id")]
    MissingCaptureId(Uuid),

    #[error("Refund processing failed: {0}")]
    RefundProcessing(Box<ServiceError>),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Conflict, retry the request: {0}")]
    RetryableConflict(String),

    #[error("One-time code is invalid")]
    OtpInvalid,

    #[error("One-time code has expired")]
    OtpExpired,

    #[error("Too many verification attempts for this one-time code")]
    OtpAttemptsExceeded,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_) | Self::EmptyCart | Self::OtpInvalid | Self::OtpExpired => {
                ErrorKind::Validation
            }
            Self::NotFound(_) | Self::ProductUnavailable(_) => ErrorKind::NotFound,
            Self::InsufficientStock { .. }
            | Self::OrderNotModifiable { .. }
            | Self::InvalidTransition { .. }
            | Self::OrderNotPayable { .. }
            | Self::ReturnWindowExpired { .. }
            | Self::OrderNotReturnable { .. }
            | Self::DuplicateReturn(_)
            | Self::AlreadyRefunded(_)
            | Self::NoCompletedPayment(_)
            | Self::MissingCaptureId(_)
            | Self::ConcurrentModification(_)
            | Self::RetryableConflict(_)
            | Self::OtpAttemptsExceeded => ErrorKind::StateConflict,
            Self::RefundProcessing(inner) => inner.kind(),
            Self::Gateway(_) => ErrorKind::Gateway,
            Self::InvariantViolation(_) => ErrorKind::Invariant,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// True when the same call may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetryableConflict(_) | Self::ConcurrentModification(_) => true,
            Self::Gateway(e) => e.outcome_unknown(),
            Self::RefundProcessing(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal and provider details are replaced with generic text.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InvariantViolation(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::Gateway(_) => GATEWAY_FAILURE_MESSAGE.to_string(),
            Self::RefundProcessing(inner) => {
                format!("Refund processing failed: {}", inner.response_message())
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = kind.status_code();

        if kind == ErrorKind::Invariant {
            tracing::error!(invariant = true, error = %self, "invariant violation reached the HTTP boundary");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: kind.as_str().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "not_found");
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ServiceError::EmptyCart.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::ProductUnavailable(Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::InvalidTransition {
                from: "Cancelled".into(),
                to: "Paid".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::DuplicateReturn(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::Gateway(GatewayError::Timeout).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::InvariantViolation("stock below zero".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::Forbidden("admin only".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn refund_processing_takes_kind_of_cause() {
        let wrapped = ServiceError::RefundProcessing(Box::new(ServiceError::Gateway(
            GatewayError::Provider {
                status: 422,
                message: "CAPTURE_FULLY_REFUNDED".into(),
            },
        )));
        assert_eq!(wrapped.kind(), ErrorKind::Gateway);

        let wrapped = ServiceError::RefundProcessing(Box::new(ServiceError::NoCompletedPayment(
            Uuid::nil(),
        )));
        assert_eq!(wrapped.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn gateway_details_are_not_leaked() {
        let err = ServiceError::Gateway(GatewayError::Provider {
            status: 500,
            message: "INTERNAL_SERVICE_ERROR debug_id=abc".into(),
        });
        assert_eq!(err.response_message(), GATEWAY_FAILURE_MESSAGE);

        let wrapped = ServiceError::RefundProcessing(Box::new(err));
        assert!(!wrapped.response_message().contains("debug_id"));
        assert!(wrapped.response_message().contains(GATEWAY_FAILURE_MESSAGE));
    }

    #[test]
    fn insufficient_stock_message_is_actionable() {
        let err = ServiceError::InsufficientStock {
            product_id: Uuid::nil(),
            product_name: "Widget".into(),
            available: 1,
            requested: 3,
        };
        let message = err.response_message();
        assert!(message.contains("Widget"));
        assert!(message.contains("requested 3"));
        assert!(message.contains("available 1"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ServiceError::RetryableConflict("order number".into()).is_retryable());
        assert!(ServiceError::Gateway(GatewayError::Timeout).is_retryable());
        assert!(!ServiceError::AlreadyRefunded(Uuid::nil()).is_retryable());
        assert!(!ServiceError::Gateway(GatewayError::Provider {
            status: 422,
            message: "UNPROCESSABLE_ENTITY".into()
        })
        .is_retryable());
    }
}
