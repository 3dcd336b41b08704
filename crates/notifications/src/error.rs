//! Notification error types

use consultdesk_shared::LedgerError;
use thiserror::Error;

/// Notification error
#[derive(Debug, Clone, Error)]
pub enum NotificationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Email provider error: {message}")]
    ExternalProvider { message: String, transient: bool },

    #[error("Concurrent modification: {0}")]
    ConcurrencyConflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NotificationError {
    pub fn provider(message: impl Into<String>, transient: bool) -> Self {
        NotificationError::ExternalProvider {
            message: message.into(),
            transient,
        }
    }
}

impl From<LedgerError> for NotificationError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound { .. } => NotificationError::NotFound(e.to_string()),
            LedgerError::ConcurrencyConflict { .. } => {
                NotificationError::ConcurrencyConflict(e.to_string())
            }
            LedgerError::Constraint(msg) => NotificationError::Validation(msg),
            LedgerError::Database(msg) => NotificationError::Database(msg),
        }
    }
}

pub type NotificationResult<T> = Result<T, NotificationError>;
