//! Retry policy for ledger writes that follow a completed provider call
//!
//! Once the payment provider has accepted a side effect, the local write that
//! records it must not be lost to a version conflict or a dropped connection.
//! The action is re-run from scratch on each attempt, so it must re-read the
//! row it is about to update.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Attempts after the first one
pub const MAX_LEDGER_RETRIES: usize = 5;

pub async fn retry_ledger_write<T, F, Fut>(operation: &'static str, action: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    // 20ms, 40ms, 80ms ... capped at 500ms
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(10)
        .max_delay(Duration::from_millis(500))
        .map(jitter)
        .take(MAX_LEDGER_RETRIES);

    RetryIf::spawn(strategy, action, |e: &BillingError| {
        let retry = e.is_retryable();
        if retry {
            tracing::warn!(operation, error = %e, "Ledger write failed, retrying");
        }
        retry
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_conflicts_are_retried_until_success() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result = retry_ledger_write("test", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BillingError::ConcurrencyConflict("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: BillingResult<()> = retry_ledger_write("test", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BillingError::NotFound("org".into()))
        })
        .await;

        assert!(matches!(result, Err(BillingError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: BillingResult<()> = retry_ledger_write("test", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BillingError::Database("down".into()))
        })
        .await;

        assert!(matches!(result, Err(BillingError::Database(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_LEDGER_RETRIES + 1);
    }
}
