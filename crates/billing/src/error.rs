//! Billing error types

use consultdesk_shared::LedgerError;
use thiserror::Error;

/// Billing error
#[derive(Debug, Clone, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Payment provider error: {message}")]
    ExternalProvider { message: String, transient: bool },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Concurrent modification: {0}")]
    ConcurrencyConflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,
}

impl BillingError {
    pub fn provider(message: impl Into<String>, transient: bool) -> Self {
        BillingError::ExternalProvider {
            message: message.into(),
            transient,
        }
    }

    /// Whether the caller may retry the same operation
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::ConcurrencyConflict(_) | BillingError::Database(_) => true,
            BillingError::ExternalProvider { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<LedgerError> for BillingError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound { .. } => BillingError::NotFound(e.to_string()),
            LedgerError::ConcurrencyConflict { .. } => {
                BillingError::ConcurrencyConflict(e.to_string())
            }
            LedgerError::Constraint(msg) => BillingError::Precondition(msg),
            LedgerError::Database(msg) => BillingError::Database(msg),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match &e {
            stripe::StripeError::Stripe(req) => {
                // Rate limits and provider-side failures are worth retrying
                let transient = req.http_status == 429 || req.http_status >= 500;
                BillingError::provider(
                    format!(
                        "{} (status {})",
                        req.message.as_deref().unwrap_or("request failed"),
                        req.http_status
                    ),
                    transient,
                )
            }
            stripe::StripeError::Timeout | stripe::StripeError::ClientError(_) => {
                BillingError::provider(e.to_string(), true)
            }
            _ => BillingError::provider(e.to_string(), false),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_errors_map_to_taxonomy() {
        let err: BillingError = LedgerError::NotFound {
            entity: "organization",
            id: "x".into(),
        }
        .into();
        assert!(matches!(err, BillingError::NotFound(_)));

        let err: BillingError = LedgerError::ConcurrencyConflict {
            entity: "organization",
            id: "x".into(),
        }
        .into();
        assert!(matches!(err, BillingError::ConcurrencyConflict(_)));
        assert!(err.is_retryable());

        let err: BillingError = LedgerError::Constraint("missing customer".into()).into();
        assert!(matches!(err, BillingError::Precondition(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_only_transient_provider_errors_are_retryable() {
        assert!(BillingError::provider("timeout", true).is_retryable());
        assert!(!BillingError::provider("card declined", false).is_retryable());
        assert!(!BillingError::Validation("bad".into()).is_retryable());
    }
}
