//! Payment provider webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use consultdesk_billing::WebhookDisposition;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /webhooks/billing
///
/// 400 only when the delivery cannot be authenticated or parsed. Once an
/// event is verified it is always acknowledged with 200, even if applying it
/// failed; failures are recorded for replay and covered by resync.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivery without signature header");
            ApiError::InvalidSignature
        })?;

    let event = billing.webhooks.verify_event(&body, signature)?;

    let status = match billing.webhooks.handle_event(&event, &body).await {
        Ok(WebhookDisposition::Processed(outcome)) => json!(outcome),
        Ok(WebhookDisposition::Duplicate) => json!("duplicate"),
        Ok(WebhookDisposition::Failed(_)) => json!("failed"),
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Could not claim webhook event; acknowledging, resync will reconcile"
            );
            json!("failed")
        }
    };

    Ok(Json(json!({ "received": true, "status": status })))
}
