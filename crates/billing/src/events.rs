//! Provider-neutral billing events
//!
//! Inbound webhook envelopes (`{id, type, created, data: {object}, metadata}`)
//! are parsed into [`BillingEvent`] at the edge so the state manager never
//! sees provider JSON. Only the fields the state machine needs are
//! extracted; everything else in the payload is ignored.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A parsed provider event
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    /// Provider event type as received (e.g. `customer.subscription.updated`)
    pub event_type: String,
    /// When the provider created the event
    pub created: OffsetDateTime,
    pub kind: BillingEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    /// `invoice.payment_succeeded` and `invoice.paid`
    PaymentSucceeded(InvoiceSnapshot),
    PaymentFailed(InvoiceSnapshot),
    /// Acknowledged and ignored
    Unhandled,
}

/// The subscription fields carried by a subscription event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    /// Provider status string
    pub status: String,
    pub price_id: Option<String>,
    pub org_id: Option<Uuid>,
}

/// The invoice fields carried by an invoice event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvoiceSnapshot {
    pub invoice_id: Option<String>,
    pub customer_id: Option<String>,
    /// Absent for one-off invoices
    pub subscription_id: Option<String>,
    pub org_id: Option<Uuid>,
}

impl BillingEvent {
    /// Parse a raw webhook body
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let envelope: EventEnvelope = serde_json::from_str(payload)
            .map_err(|e| BillingError::Validation(format!("Malformed event envelope: {}", e)))?;
        envelope.into_event()
    }

    /// Customer id referenced by the event, if any
    pub fn customer_id(&self) -> Option<&str> {
        match &self.kind {
            BillingEventKind::SubscriptionCreated(s)
            | BillingEventKind::SubscriptionUpdated(s)
            | BillingEventKind::SubscriptionDeleted(s) => s.customer_id.as_deref(),
            BillingEventKind::PaymentSucceeded(i) | BillingEventKind::PaymentFailed(i) => {
                i.customer_id.as_deref()
            }
            BillingEventKind::Unhandled => None,
        }
    }

    /// Organization id carried in the event's metadata, if any
    pub fn org_id(&self) -> Option<Uuid> {
        match &self.kind {
            BillingEventKind::SubscriptionCreated(s)
            | BillingEventKind::SubscriptionUpdated(s)
            | BillingEventKind::SubscriptionDeleted(s) => s.org_id,
            BillingEventKind::PaymentSucceeded(i) | BillingEventKind::PaymentFailed(i) => i.org_id,
            BillingEventKind::Unhandled => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    /// Unix seconds
    created: i64,
    data: EventData,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

impl EventEnvelope {
    fn into_event(self) -> BillingResult<BillingEvent> {
        if self.id.is_empty() {
            return Err(BillingError::Validation("Event id is empty".to_string()));
        }
        let created = OffsetDateTime::from_unix_timestamp(self.created)
            .map_err(|e| BillingError::Validation(format!("Invalid event timestamp: {}", e)))?;

        let envelope_org = self.metadata.as_ref().and_then(org_id_from_metadata);
        let object = &self.data.object;

        let kind = match self.event_type.as_str() {
            "customer.subscription.created" => {
                BillingEventKind::SubscriptionCreated(subscription_snapshot(object, envelope_org)?)
            }
            "customer.subscription.updated" => {
                BillingEventKind::SubscriptionUpdated(subscription_snapshot(object, envelope_org)?)
            }
            "customer.subscription.deleted" => {
                BillingEventKind::SubscriptionDeleted(subscription_snapshot(object, envelope_org)?)
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                BillingEventKind::PaymentSucceeded(invoice_snapshot(object, envelope_org))
            }
            "invoice.payment_failed" => {
                BillingEventKind::PaymentFailed(invoice_snapshot(object, envelope_org))
            }
            _ => BillingEventKind::Unhandled,
        };

        Ok(BillingEvent {
            id: self.id,
            event_type: self.event_type,
            created,
            kind,
        })
    }
}

/// A reference that may be a bare id or an expanded object with an `id`
fn reference_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id.clone()),
        Value::Object(object) => object.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn org_id_from_metadata(metadata: &Value) -> Option<Uuid> {
    metadata
        .get("org_id")?
        .as_str()
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn subscription_snapshot(
    object: &Value,
    envelope_org: Option<Uuid>,
) -> BillingResult<SubscriptionSnapshot> {
    let subscription_id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::Validation("Subscription event without id".to_string()))?;
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::Validation("Subscription event without status".to_string()))?;

    let price_id = object
        .pointer("/items/data/0/price/id")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(SubscriptionSnapshot {
        subscription_id: subscription_id.to_string(),
        customer_id: reference_id(object.get("customer")),
        status: status.to_string(),
        price_id,
        org_id: object
            .get("metadata")
            .and_then(org_id_from_metadata)
            .or(envelope_org),
    })
}

fn invoice_snapshot(object: &Value, envelope_org: Option<Uuid>) -> InvoiceSnapshot {
    // Newer API versions move the subscription under parent.subscription_details
    let subscription_id = reference_id(object.get("subscription")).or_else(|| {
        reference_id(object.pointer("/parent/subscription_details/subscription"))
    });

    let org_id = object
        .pointer("/subscription_details/metadata")
        .and_then(org_id_from_metadata)
        .or_else(|| {
            object
                .pointer("/parent/subscription_details/metadata")
                .and_then(org_id_from_metadata)
        })
        .or_else(|| object.get("metadata").and_then(org_id_from_metadata))
        .or(envelope_org);

    InvoiceSnapshot {
        invoice_id: object.get("id").and_then(Value::as_str).map(str::to_string),
        customer_id: reference_id(object.get("customer")),
        subscription_id,
        org_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscription_event() {
        let org_id = Uuid::new_v4();
        let payload = json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": {"object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "metadata": {"org_id": org_id.to_string()},
                "items": {"data": [{"price": {"id": "price_professional"}}]}
            }}
        })
        .to_string();

        let event = BillingEvent::parse(&payload).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.created.unix_timestamp(), 1_700_000_000);
        assert_eq!(event.org_id(), Some(org_id));
        assert_eq!(event.customer_id(), Some("cus_1"));
        match event.kind {
            BillingEventKind::SubscriptionUpdated(snapshot) => {
                assert_eq!(snapshot.status, "active");
                assert_eq!(snapshot.price_id.as_deref(), Some("price_professional"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_invoice_paid_is_payment_succeeded() {
        let payload = json!({
            "id": "evt_2",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "data": {"object": {
                "id": "in_1",
                "customer": {"id": "cus_9"},
                "subscription": "sub_9"
            }}
        })
        .to_string();

        let event = BillingEvent::parse(&payload).unwrap();
        match event.kind {
            BillingEventKind::PaymentSucceeded(invoice) => {
                assert_eq!(invoice.customer_id.as_deref(), Some("cus_9"));
                assert_eq!(invoice.subscription_id.as_deref(), Some("sub_9"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_envelope_metadata_supplies_org() {
        let org_id = Uuid::new_v4();
        let payload = json!({
            "id": "evt_3",
            "type": "invoice.payment_failed",
            "created": 1_700_000_000,
            "data": {"object": {"customer": "cus_1", "subscription": "sub_1"}},
            "metadata": {"org_id": org_id.to_string()}
        })
        .to_string();

        assert_eq!(BillingEvent::parse(&payload).unwrap().org_id(), Some(org_id));
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let payload = json!({
            "id": "evt_4",
            "type": "charge.dispute.created",
            "created": 1_700_000_000,
            "data": {"object": {"id": "dp_1"}}
        })
        .to_string();

        let event = BillingEvent::parse(&payload).unwrap();
        assert_eq!(event.kind, BillingEventKind::Unhandled);
        assert_eq!(event.event_type, "charge.dispute.created");
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        assert!(matches!(
            BillingEvent::parse("not json"),
            Err(BillingError::Validation(_))
        ));
        let missing_status = json!({
            "id": "evt_5",
            "type": "customer.subscription.created",
            "created": 1_700_000_000,
            "data": {"object": {"id": "sub_1"}}
        })
        .to_string();
        assert!(matches!(
            BillingEvent::parse(&missing_status),
            Err(BillingError::Validation(_))
        ));
    }
}
