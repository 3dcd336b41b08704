//! API error responses
//!
//! Every failure leaves the server as `{"error": <message>, "code": <code>}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use consultdesk_billing::BillingError;
use consultdesk_notifications::NotificationError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("{0}")]
    ExternalProvider(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Precondition(_) => (StatusCode::PRECONDITION_FAILED, "precondition_failed"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "concurrency_conflict"),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "invalid_signature"),
            ApiError::ExternalProvider(_) => (StatusCode::BAD_GATEWAY, "external_provider_error"),
            ApiError::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_configured"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let error = match &self {
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Precondition(msg) => ApiError::Precondition(msg),
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::ConcurrencyConflict(msg) => ApiError::Conflict(msg),
            BillingError::ExternalProvider { message, .. } => ApiError::ExternalProvider(message),
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::Database(msg) | BillingError::Config(msg) | BillingError::Internal(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

impl From<NotificationError> for ApiError {
    fn from(e: NotificationError) -> Self {
        match e {
            NotificationError::NotFound(msg) => ApiError::NotFound(msg),
            NotificationError::Validation(msg) => ApiError::Validation(msg),
            NotificationError::ConcurrencyConflict(msg) => ApiError::Conflict(msg),
            NotificationError::ExternalProvider { message, .. } => {
                ApiError::ExternalProvider(message)
            }
            NotificationError::Database(msg) | NotificationError::Config(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_taxonomy_maps_to_status() {
        let cases = [
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                BillingError::Precondition("x".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (BillingError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                BillingError::ConcurrencyConflict("x".into()),
                StatusCode::CONFLICT,
            ),
            (BillingError::provider("x", true), StatusCode::BAD_GATEWAY),
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (
                BillingError::Database("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_and_code().0, status);
        }
    }
}
