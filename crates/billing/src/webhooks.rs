//! Webhook dispatch
//!
//! Verifies inbound provider events, de-duplicates them by event id and hands
//! them to the subscription state manager. Every received event is recorded
//! with its payload and processing result so failures can be replayed.

use std::sync::Arc;

use consultdesk_shared::{LedgerStore, WebhookEventClaim, WebhookProcessingResult};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::signature::SignatureVerifier;
use crate::subscriptions::{ApplyOutcome, SubscriptionService};

/// A claim stuck in `processing` for longer than this may be taken over
pub const PROCESSING_TIMEOUT: time::Duration = time::Duration::minutes(30);

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum WebhookDisposition {
    Processed(ApplyOutcome),
    /// Already processed, or being processed by someone else
    Duplicate,
    /// Processing failed; the event is recorded for replay
    Failed(String),
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub event_id: String,
    pub event_type: String,
    pub previous_error: Option<String>,
    pub new_status: WebhookProcessingResult,
    pub new_error: Option<String>,
    pub success: bool,
}

/// Webhook handler for payment provider events
#[derive(Clone)]
pub struct WebhookHandler {
    verifier: Arc<dyn SignatureVerifier>,
    subscriptions: SubscriptionService,
    ledger: Arc<dyn LedgerStore>,
}

impl WebhookHandler {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        subscriptions: SubscriptionService,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            verifier,
            subscriptions,
            ledger,
        }
    }

    /// Verify and parse a webhook delivery
    ///
    /// Fails with `WebhookSignatureInvalid` if the signature does not check
    /// out and with `Validation` if the verified body is not an event envelope.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<BillingEvent> {
        if !self.verifier.verify(payload, signature) {
            tracing::warn!(
                payload_len = payload.len(),
                "Rejected webhook with invalid signature"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event = BillingEvent::parse(payload).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse verified webhook event");
            e
        })?;

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified event
    ///
    /// The claim is an atomic insert keyed by event id, so exactly one
    /// concurrent delivery of the same event gets to apply it. Processing
    /// errors are recorded and reported in the disposition rather than
    /// returned; only a failure to claim is an `Err`.
    pub async fn handle_event(
        &self,
        event: &BillingEvent,
        payload: &str,
    ) -> BillingResult<WebhookDisposition> {
        let claim = WebhookEventClaim {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            event_timestamp: event.created,
            payload: payload.to_string(),
            stale_after: PROCESSING_TIMEOUT,
        };

        let claimed = self.ledger.claim_webhook_event(&claim).await.map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::from(e)
        })?;

        if !claimed {
            let reason = match self.ledger.get_webhook_event(&event.id).await {
                Ok(Some(record)) => match record.processing_result {
                    WebhookProcessingResult::Success => "already processed successfully",
                    WebhookProcessingResult::Processing => {
                        "currently being processed by another worker"
                    }
                    WebhookProcessingResult::Error => "previously failed, awaiting replay",
                },
                Ok(None) => "unknown (race condition?)",
                Err(_) => "unknown (lookup failed)",
            };

            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Duplicate webhook event - atomic idempotency check"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        tracing::info!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Processing webhook event (claimed exclusive processing rights)"
        );

        let result = self.subscriptions.apply_webhook_event(event).await;
        self.record_result(&event.id, &result).await;

        Ok(match result {
            Ok(outcome) => WebhookDisposition::Processed(outcome),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed; acknowledging and recording for replay"
                );
                WebhookDisposition::Failed(e.to_string())
            }
        })
    }

    /// Persist the processing result, retrying once
    async fn record_result(&self, event_id: &str, result: &BillingResult<ApplyOutcome>) {
        let (processing_result, error_message) = match result {
            Ok(_) => (WebhookProcessingResult::Success, None),
            Err(e) => (WebhookProcessingResult::Error, Some(e.to_string())),
        };

        let first = self
            .ledger
            .complete_webhook_event(event_id, processing_result, error_message.as_deref())
            .await;

        if let Err(e) = first {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to update webhook event failed, retrying..."
            );

            if let Err(retry_err) = self
                .ledger
                .complete_webhook_event(event_id, processing_result, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    processing_result = %processing_result.as_str(),
                    error_message = ?error_message,
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: Failed to update webhook audit record after retry. \
                     Event will stay in 'processing' until reclaimed."
                );
            }
        }
    }

    /// Re-run a stored event from its recorded payload
    ///
    /// The payload was verified when it was first received, so it is not
    /// verified again.
    pub async fn replay_webhook(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(event_id = %event_id, "Attempting to replay webhook event");

        let record = self.ledger.get_webhook_event(event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Webhook event {} not found", event_id))
        })?;

        let event = BillingEvent::parse(&record.payload)?;
        let result = self.subscriptions.apply_webhook_event(&event).await;
        self.record_result(event_id, &result).await;

        let (new_status, new_error) = match &result {
            Ok(_) => (WebhookProcessingResult::Success, None),
            Err(e) => (WebhookProcessingResult::Error, Some(e.to_string())),
        };

        tracing::info!(
            event_id = %event_id,
            new_status = %new_status.as_str(),
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id: event_id.to_string(),
            event_type: record.event_type,
            previous_error: record.error_message,
            new_status,
            new_error,
            success: result.is_ok(),
        })
    }

    /// Replay failed events, oldest first
    pub async fn replay_failed(&self, limit: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed = self.ledger.list_failed_webhook_events(limit).await?;
        let mut results = Vec::with_capacity(failed.len());

        for record in failed {
            match self.replay_webhook(&record.event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        event_id = %record.event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        event_id: record.event_id,
                        event_type: record.event_type,
                        previous_error: record.error_message,
                        new_status: WebhookProcessingResult::Error,
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Drop event records older than the retention window
    pub async fn purge_processed_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let removed = self.ledger.purge_webhook_events(older_than).await?;
        tracing::info!(
            removed = removed,
            older_than = %older_than,
            "Purged processed webhook events"
        );
        Ok(removed)
    }
}
