//! Subscription management
//!
//! [`SubscriptionService`] owns every billing transition of an organization,
//! whether it comes from a direct API call or from an inbound provider event.
//!
//! Direct operations call the payment provider first and only write to the
//! ledger once the provider has accepted the change, so no local row ever
//! points at an external resource that does not exist. The ledger write that
//! follows is retried (re-reading the row each time) because the external side
//! effect has already happened.

use std::sync::Arc;

use consultdesk_shared::{
    BillingUpdate, LedgerStore, Organization, SubscriptionPlan, SubscriptionStatus,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, BillingEventKind};
use crate::gateway::{PaymentGateway, PaymentIntentHandle, ProviderSubscription, SubscriptionRequest};
use crate::retry::retry_ledger_write;

/// What applying an event (or a resync) did to the organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Billing fields were written
    Applied,
    /// The event matched the current state exactly
    Unchanged,
    /// Older than the last event already applied
    Stale,
    /// Not relevant to the organization's billing state
    Ignored,
}

/// Result of creating a subscription
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHandle {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub plan: SubscriptionPlan,
    /// Secret the client uses to confirm the first payment
    pub client_secret: Option<String>,
}

/// Local billing state plus the provider's view of the customer's subscriptions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusView {
    pub organization_id: Uuid,
    pub plan: SubscriptionPlan,
    pub status: SubscriptionStatus,
    pub external_customer_id: Option<String>,
    pub subscriptions: Vec<ProviderSubscription>,
}

/// Decision taken against a freshly read organization
pub(crate) enum Decision {
    Write(BillingUpdate),
    Skip(ApplyOutcome),
}

/// Billing state manager
#[derive(Clone)]
pub struct SubscriptionService {
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) ledger: Arc<dyn LedgerStore>,
    pub(crate) prices: PriceIds,
}

/// Timestamp for direct operations, at the provider's one-second resolution
pub(crate) fn stamp(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_nanosecond(0).unwrap_or(now)
}

fn later(current: Option<OffsetDateTime>, candidate: OffsetDateTime) -> Option<OffsetDateTime> {
    Some(current.map_or(candidate, |current| current.max(candidate)))
}

impl SubscriptionService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn LedgerStore>,
        prices: PriceIds,
    ) -> Self {
        Self {
            gateway,
            ledger,
            prices,
        }
    }

    pub(crate) async fn load_organization(&self, org_id: Uuid) -> BillingResult<Organization> {
        self.ledger
            .get_organization(org_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", org_id)))
    }

    fn require_customer(org: &Organization) -> BillingResult<String> {
        org.external_customer_id.clone().ok_or_else(|| {
            BillingError::Precondition(format!(
                "Organization {} has no billing customer; create one first",
                org.id
            ))
        })
    }

    fn plan_for_price(&self, price_id: &str) -> BillingResult<SubscriptionPlan> {
        self.prices
            .plan_for_price(price_id)
            .ok_or_else(|| BillingError::Validation(format!("Unknown price id: {}", price_id)))
    }

    /// Re-read, decide, compare-and-swap; retried on conflicts and database errors
    pub(crate) async fn write_billing<F>(
        &self,
        operation: &'static str,
        org_id: Uuid,
        decide: F,
    ) -> BillingResult<(Organization, ApplyOutcome)>
    where
        F: Fn(&Organization) -> BillingResult<Decision> + Send + Sync,
    {
        let this = self;
        let decide = &decide;
        retry_ledger_write(operation, || async move {
            let org = this.load_organization(org_id).await?;
            match decide(&org)? {
                Decision::Skip(outcome) => Ok((org, outcome)),
                Decision::Write(update) if update == org.billing() => {
                    Ok((org, ApplyOutcome::Unchanged))
                }
                Decision::Write(update) => {
                    let updated = this
                        .ledger
                        .update_organization_billing(org.id, org.version, &update)
                        .await?;
                    Ok((updated, ApplyOutcome::Applied))
                }
            }
        })
        .await
    }

    /// Create the provider customer for an organization and record its id
    ///
    /// Returns the existing id without calling the provider if the
    /// organization already has one.
    pub async fn create_customer(
        &self,
        org_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<String> {
        let email = email.trim();
        let name = name.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::Validation(format!(
                "Invalid email address: {:?}",
                email
            )));
        }
        if name.is_empty() {
            return Err(BillingError::Validation("Customer name is empty".to_string()));
        }

        let org = self.load_organization(org_id).await?;
        if let Some(existing) = org.external_customer_id {
            tracing::info!(
                org_id = %org_id,
                customer_id = %existing,
                "Organization already has a billing customer"
            );
            return Ok(existing);
        }

        let customer_id = self.gateway.create_customer(org_id, email, name).await?;

        let (org, _) = self
            .write_billing("create_customer", org_id, |org| {
                if let Some(existing) = &org.external_customer_id {
                    tracing::warn!(
                        org_id = %org_id,
                        existing_customer_id = %existing,
                        new_customer_id = %customer_id,
                        "Customer recorded concurrently, keeping the existing one"
                    );
                    return Ok(Decision::Skip(ApplyOutcome::Unchanged));
                }
                Ok(Decision::Write(BillingUpdate {
                    external_customer_id: Some(customer_id.clone()),
                    ..org.billing()
                }))
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    org_id = %org_id,
                    customer_id = %customer_id,
                    error = %e,
                    "CRITICAL: Customer created at provider but not recorded locally"
                );
                e
            })?;

        tracing::info!(
            org_id = %org_id,
            customer_id = %customer_id,
            "Created billing customer"
        );

        Ok(org.external_customer_id.unwrap_or(customer_id))
    }

    /// Subscribe an organization to a price
    ///
    /// Requires a customer. The subscription is created with its first
    /// payment left incomplete; the returned client secret lets the client
    /// confirm it.
    pub async fn create_subscription(
        &self,
        org_id: Uuid,
        price_id: &str,
        payment_method_id: Option<&str>,
    ) -> BillingResult<SubscriptionHandle> {
        let org = self.load_organization(org_id).await?;
        let plan = self.plan_for_price(price_id)?;
        let customer_id = Self::require_customer(&org)?;

        if let Some(payment_method_id) = payment_method_id {
            self.gateway
                .attach_payment_method(&customer_id, payment_method_id)
                .await?;
        }

        let subscription = self
            .gateway
            .create_subscription(&SubscriptionRequest {
                org_id,
                customer_id: customer_id.clone(),
                price_id: price_id.to_string(),
                default_payment_method: payment_method_id.map(str::to_string),
            })
            .await?;

        let status = SubscriptionStatus::from_provider(&subscription.status).unwrap_or_else(|| {
            tracing::warn!(
                org_id = %org_id,
                subscription_id = %subscription.id,
                provider_status = %subscription.status,
                "Unrecognized provider status on new subscription, recording as incomplete"
            );
            SubscriptionStatus::Incomplete
        });
        let now = stamp(OffsetDateTime::now_utc());

        self.write_billing("create_subscription", org_id, |org| {
            Ok(Decision::Write(BillingUpdate {
                external_customer_id: org.external_customer_id.clone(),
                subscription_plan: plan,
                subscription_status: status,
                last_event_at: later(org.last_event_at, now),
            }))
        })
        .await
        .map_err(|e| {
            tracing::error!(
                org_id = %org_id,
                subscription_id = %subscription.id,
                error = %e,
                "CRITICAL: Subscription created at provider but not recorded locally"
            );
            e
        })?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %plan,
            status = %status,
            "Created subscription"
        );

        Ok(SubscriptionHandle {
            subscription_id: subscription.id,
            status,
            plan,
            client_secret: subscription.client_secret,
        })
    }

    /// Make sure a subscription id belongs to the organization's customer
    async fn require_owned_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<()> {
        if subscription_id.trim().is_empty() {
            return Err(BillingError::Validation("Subscription id is empty".to_string()));
        }
        let owned = self
            .gateway
            .list_subscriptions(customer_id)
            .await?
            .iter()
            .any(|subscription| subscription.id == subscription_id);
        if !owned {
            return Err(BillingError::NotFound(format!(
                "Subscription {} not found for customer {}",
                subscription_id, customer_id
            )));
        }
        Ok(())
    }

    /// Cancel a subscription immediately and downgrade the organization to basic
    pub async fn cancel_subscription(
        &self,
        org_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<Organization> {
        let org = self.load_organization(org_id).await?;
        let customer_id = Self::require_customer(&org)?;
        self.require_owned_subscription(&customer_id, subscription_id)
            .await?;

        self.gateway.cancel_subscription(subscription_id).await?;
        let now = stamp(OffsetDateTime::now_utc());

        let (org, _) = self
            .write_billing("cancel_subscription", org_id, |org| {
                Ok(Decision::Write(BillingUpdate {
                    external_customer_id: org.external_customer_id.clone(),
                    subscription_plan: SubscriptionPlan::Basic,
                    subscription_status: SubscriptionStatus::Canceled,
                    last_event_at: later(org.last_event_at, now),
                }))
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    org_id = %org_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "CRITICAL: Subscription canceled at provider but not recorded locally"
                );
                e
            })?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription_id,
            "Cancelled subscription"
        );

        Ok(org)
    }

    /// Move a subscription to a new price, with proration
    pub async fn update_subscription(
        &self,
        org_id: Uuid,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<Organization> {
        let org = self.load_organization(org_id).await?;
        let plan = self.plan_for_price(new_price_id)?;
        let customer_id = Self::require_customer(&org)?;
        self.require_owned_subscription(&customer_id, subscription_id)
            .await?;

        let subscription = self
            .gateway
            .update_subscription_price(subscription_id, new_price_id)
            .await?;
        let reported_status = SubscriptionStatus::from_provider(&subscription.status);
        let now = stamp(OffsetDateTime::now_utc());

        let (org, _) = self
            .write_billing("update_subscription", org_id, |org| {
                Ok(Decision::Write(BillingUpdate {
                    external_customer_id: org.external_customer_id.clone(),
                    subscription_plan: plan,
                    subscription_status: reported_status.unwrap_or(org.subscription_status),
                    last_event_at: later(org.last_event_at, now),
                }))
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    org_id = %org_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "CRITICAL: Subscription updated at provider but not recorded locally"
                );
                e
            })?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription_id,
            plan = %plan,
            "Updated subscription price"
        );

        Ok(org)
    }

    /// Create a one-off payment intent for the organization's customer
    pub async fn create_payment_intent(
        &self,
        org_id: Uuid,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<PaymentIntentHandle> {
        if amount_cents <= 0 {
            return Err(BillingError::Validation(format!(
                "Amount must be positive, got {}",
                amount_cents
            )));
        }
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::Validation(format!(
                "Currency must be a three-letter code, got {:?}",
                currency
            )));
        }

        let org = self.load_organization(org_id).await?;
        let customer_id = Self::require_customer(&org)?;

        let intent = self
            .gateway
            .create_payment_intent(&customer_id, amount_cents, &currency.to_ascii_lowercase())
            .await?;

        tracing::info!(
            org_id = %org_id,
            payment_intent_id = %intent.id,
            amount_cents = amount_cents,
            "Created payment intent"
        );

        Ok(intent)
    }

    pub async fn get_subscription_status(
        &self,
        org_id: Uuid,
    ) -> BillingResult<SubscriptionStatusView> {
        let org = self.load_organization(org_id).await?;

        let subscriptions = match &org.external_customer_id {
            Some(customer_id) => self.gateway.list_subscriptions(customer_id).await?,
            None => Vec::new(),
        };

        Ok(SubscriptionStatusView {
            organization_id: org.id,
            plan: org.subscription_plan,
            status: org.subscription_status,
            external_customer_id: org.external_customer_id,
            subscriptions,
        })
    }

    /// Apply a provider event to the organization it concerns
    ///
    /// Safe to call repeatedly with the same event: the result depends only on
    /// the event and the organization's current row. Events older than the last
    /// one applied are skipped.
    pub async fn apply_webhook_event(&self, event: &BillingEvent) -> BillingResult<ApplyOutcome> {
        if event.kind == BillingEventKind::Unhandled {
            tracing::info!(
                event_type = %event.event_type,
                event_id = %event.id,
                "Received unhandled event type - no handler configured"
            );
            return Ok(ApplyOutcome::Ignored);
        }

        let org = self.resolve_organization(event).await?;
        let (org, outcome) = self
            .write_billing("apply_webhook_event", org.id, |org| {
                Ok(self.transition(org, event))
            })
            .await?;

        tracing::info!(
            org_id = %org.id,
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            status = %org.subscription_status,
            plan = %org.subscription_plan,
            "Applied billing event"
        );

        Ok(outcome)
    }

    async fn resolve_organization(&self, event: &BillingEvent) -> BillingResult<Organization> {
        if let Some(org_id) = event.org_id() {
            if let Some(org) = self.ledger.get_organization(org_id).await? {
                return Ok(org);
            }
        }
        if let Some(customer_id) = event.customer_id() {
            if let Some(org) = self.ledger.find_organization_by_customer(customer_id).await? {
                return Ok(org);
            }
        }
        Err(BillingError::NotFound(format!(
            "No organization for event {} (customer {:?})",
            event.id,
            event.customer_id()
        )))
    }

    /// The state machine: new billing fields for `org` after `event`
    fn transition(&self, org: &Organization, event: &BillingEvent) -> Decision {
        if let Some(last) = org.last_event_at {
            if event.created < last {
                tracing::info!(
                    org_id = %org.id,
                    event_id = %event.id,
                    event_created = %event.created,
                    last_event_at = %last,
                    "Skipping event older than the last one applied"
                );
                return Decision::Skip(ApplyOutcome::Stale);
            }
        }

        let mut update = org.billing();

        match (org.external_customer_id.as_deref(), event.customer_id()) {
            // Adopt the event's customer so a non-none status always has one
            (None, Some(customer_id)) => {
                update.external_customer_id = Some(customer_id.to_string());
            }
            (Some(current), Some(customer_id)) if current != customer_id => {
                tracing::warn!(
                    org_id = %org.id,
                    event_id = %event.id,
                    current_customer_id = %current,
                    event_customer_id = %customer_id,
                    "Event references a different customer, ignoring"
                );
                return Decision::Skip(ApplyOutcome::Ignored);
            }
            _ => {}
        }

        match &event.kind {
            BillingEventKind::SubscriptionCreated(subscription)
            | BillingEventKind::SubscriptionUpdated(subscription) => {
                let Some(status) = SubscriptionStatus::from_provider(&subscription.status) else {
                    tracing::warn!(
                        org_id = %org.id,
                        event_id = %event.id,
                        provider_status = %subscription.status,
                        "Unrecognized subscription status, ignoring"
                    );
                    return Decision::Skip(ApplyOutcome::Ignored);
                };
                update.subscription_status = status;
                if status == SubscriptionStatus::Canceled {
                    update.subscription_plan = SubscriptionPlan::Basic;
                } else if let Some(plan) = subscription
                    .price_id
                    .as_deref()
                    .and_then(|price_id| self.prices.plan_for_price(price_id))
                {
                    update.subscription_plan = plan;
                }
            }
            BillingEventKind::SubscriptionDeleted(_) => {
                update.subscription_status = SubscriptionStatus::Canceled;
                update.subscription_plan = SubscriptionPlan::Basic;
            }
            BillingEventKind::PaymentSucceeded(invoice) => {
                if invoice.subscription_id.is_none() {
                    return Decision::Skip(ApplyOutcome::Ignored);
                }
                match org.subscription_status {
                    SubscriptionStatus::Incomplete
                    | SubscriptionStatus::Active
                    | SubscriptionStatus::PastDue => {
                        update.subscription_status = SubscriptionStatus::Active;
                    }
                    // A late invoice must not resurrect a canceled subscription
                    SubscriptionStatus::None | SubscriptionStatus::Canceled => {
                        return Decision::Skip(ApplyOutcome::Ignored);
                    }
                }
            }
            BillingEventKind::PaymentFailed(invoice) => {
                if invoice.subscription_id.is_none() {
                    return Decision::Skip(ApplyOutcome::Ignored);
                }
                match org.subscription_status {
                    SubscriptionStatus::Active | SubscriptionStatus::PastDue => {
                        update.subscription_status = SubscriptionStatus::PastDue;
                    }
                    // The provider keeps a failed first payment as incomplete
                    _ => return Decision::Skip(ApplyOutcome::Ignored),
                }
            }
            BillingEventKind::Unhandled => return Decision::Skip(ApplyOutcome::Ignored),
        }

        update.last_event_at = later(org.last_event_at, event.created);
        Decision::Write(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InvoiceSnapshot, SubscriptionSnapshot};
    use crate::testing::{test_prices, FakeGateway};
    use consultdesk_shared::InMemoryLedgerStore;

    struct Harness {
        service: SubscriptionService,
        gateway: Arc<FakeGateway>,
        ledger: InMemoryLedgerStore,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(FakeGateway::new());
        let ledger = InMemoryLedgerStore::new();
        let service =
            SubscriptionService::new(gateway.clone(), Arc::new(ledger.clone()), test_prices());
        Harness {
            service,
            gateway,
            ledger,
        }
    }

    async fn org(h: &Harness) -> Organization {
        h.ledger.insert_organization("Acme").await.unwrap()
    }

    fn event_at(id: &str, created: i64, kind: BillingEventKind) -> BillingEvent {
        BillingEvent {
            id: id.to_string(),
            event_type: "test".to_string(),
            created: OffsetDateTime::from_unix_timestamp(created).unwrap(),
            kind,
        }
    }

    fn subscription(customer: &str, status: &str, price: Option<&str>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscription_id: "sub_1".to_string(),
            customer_id: Some(customer.to_string()),
            status: status.to_string(),
            price_id: price.map(str::to_string),
            org_id: None,
        }
    }

    fn invoice(customer: &str) -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_id: Some("in_1".to_string()),
            customer_id: Some(customer.to_string()),
            subscription_id: Some("sub_1".to_string()),
            org_id: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_requires_customer_then_succeeds() {
        let h = harness();
        let org = org(&h).await;

        let err = h
            .service
            .create_subscription(org.id, "price_professional", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Precondition(_)));
        assert!(h.gateway.calls().is_empty());

        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        h.gateway.set_next_subscription_status("active");
        let handle = h
            .service
            .create_subscription(org.id, "price_professional", None)
            .await
            .unwrap();
        assert_eq!(handle.status, SubscriptionStatus::Active);

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Professional);
        assert!(stored.external_customer_id.is_some());
    }

    #[tokio::test]
    async fn test_create_customer_unknown_org() {
        let h = harness();
        let err = h
            .service
            .create_customer(Uuid::new_v4(), "a@b.com", "Acme")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_writes_nothing() {
        let h = harness();
        let org = org(&h).await;
        h.gateway
            .fail_next(BillingError::provider("service unavailable", true));

        let err = h
            .service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ExternalProvider { .. }));

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.external_customer_id, None);
        assert_eq!(stored.version, org.version);
    }

    #[tokio::test]
    async fn test_create_customer_is_idempotent_per_org() {
        let h = harness();
        let org = org(&h).await;
        let first = h
            .service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        let second = h
            .service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.gateway.calls(), vec!["create_customer".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_price_rejected() {
        let h = harness();
        let org = org(&h).await;
        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        let err = h
            .service
            .create_subscription(org.id, "price_gold", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_payment_method_attached_before_subscribing() {
        let h = harness();
        let org = org(&h).await;
        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        let handle = h
            .service
            .create_subscription(org.id, "price_basic", Some("pm_card_visa"))
            .await
            .unwrap();

        assert_eq!(
            h.gateway.calls(),
            vec![
                "create_customer".to_string(),
                "attach_payment_method".to_string(),
                "create_subscription".to_string(),
            ]
        );
        // The fake defaults to an incomplete subscription with a client secret
        assert_eq!(handle.status, SubscriptionStatus::Incomplete);
        assert!(handle.client_secret.is_some());
    }

    #[tokio::test]
    async fn test_cancel_then_query() {
        let h = harness();
        let org = org(&h).await;
        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        h.gateway.set_next_subscription_status("active");
        let handle = h
            .service
            .create_subscription(org.id, "price_enterprise", None)
            .await
            .unwrap();

        h.service
            .cancel_subscription(org.id, &handle.subscription_id)
            .await
            .unwrap();

        let view = h.service.get_subscription_status(org.id).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::Canceled);
        assert_eq!(view.plan, SubscriptionPlan::Basic);
        assert_eq!(view.subscriptions.len(), 1);
        assert_eq!(view.subscriptions[0].status, "canceled");
    }

    #[tokio::test]
    async fn test_cancel_foreign_subscription_rejected() {
        let h = harness();
        let org = org(&h).await;
        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();

        let err = h
            .service
            .cancel_subscription(org.id, "sub_someone_else")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(!h.gateway.calls().contains(&"cancel_subscription".to_string()));
    }

    #[tokio::test]
    async fn test_update_subscription_changes_plan() {
        let h = harness();
        let org = org(&h).await;
        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        h.gateway.set_next_subscription_status("active");
        let handle = h
            .service
            .create_subscription(org.id, "price_basic", None)
            .await
            .unwrap();

        let updated = h
            .service
            .update_subscription(org.id, &handle.subscription_id, "price_enterprise")
            .await
            .unwrap();
        assert_eq!(updated.subscription_plan, SubscriptionPlan::Enterprise);
        assert_eq!(updated.subscription_status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_payment_intent_validation() {
        let h = harness();
        let org = org(&h).await;

        let err = h
            .service
            .create_payment_intent(org.id, 0, "usd")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = h
            .service
            .create_payment_intent(org.id, 500, "dollars")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = h
            .service
            .create_payment_intent(org.id, 500, "usd")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Precondition(_)));

        h.service
            .create_customer(org.id, "a@b.com", "Acme")
            .await
            .unwrap();
        let intent = h
            .service
            .create_payment_intent(org.id, 500, "USD")
            .await
            .unwrap();
        assert!(intent.client_secret.is_some());
    }

    #[tokio::test]
    async fn test_webhook_state_machine() {
        let h = harness();
        let org = org(&h).await;
        let customer = "cus_webhook";
        h.ledger
            .update_organization_billing(
                org.id,
                org.version,
                &BillingUpdate {
                    external_customer_id: Some(customer.to_string()),
                    ..org.billing()
                },
            )
            .await
            .unwrap();

        let steps = [
            (
                BillingEventKind::SubscriptionCreated(subscription(
                    customer,
                    "incomplete",
                    Some("price_professional"),
                )),
                SubscriptionStatus::Incomplete,
            ),
            (
                BillingEventKind::PaymentSucceeded(invoice(customer)),
                SubscriptionStatus::Active,
            ),
            (
                BillingEventKind::PaymentFailed(invoice(customer)),
                SubscriptionStatus::PastDue,
            ),
            (
                BillingEventKind::PaymentSucceeded(invoice(customer)),
                SubscriptionStatus::Active,
            ),
            (
                BillingEventKind::SubscriptionDeleted(subscription(customer, "canceled", None)),
                SubscriptionStatus::Canceled,
            ),
        ];

        for (i, (kind, expected)) in steps.into_iter().enumerate() {
            let event = event_at(&format!("evt_{}", i), 1_700_000_000 + i as i64, kind);
            let outcome = h.service.apply_webhook_event(&event).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Applied);
            let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
            assert_eq!(stored.subscription_status, expected, "after step {}", i);
        }

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Basic);
    }

    #[tokio::test]
    async fn test_webhook_adopts_customer_from_event() {
        let h = harness();
        let org = org(&h).await;
        let mut snapshot = subscription("cus_new", "active", Some("price_basic"));
        snapshot.org_id = Some(org.id);

        let event = event_at(
            "evt_1",
            1_700_000_000,
            BillingEventKind::SubscriptionCreated(snapshot),
        );
        h.service.apply_webhook_event(&event).await.unwrap();

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.external_customer_id.as_deref(), Some("cus_new"));
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_customer_is_not_found() {
        let h = harness();
        let event = event_at(
            "evt_1",
            1_700_000_000,
            BillingEventKind::PaymentFailed(invoice("cus_nobody")),
        );
        let err = h.service.apply_webhook_event(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_late_invoice_does_not_resurrect_canceled() {
        let h = harness();
        let org = org(&h).await;
        h.ledger
            .update_organization_billing(
                org.id,
                org.version,
                &BillingUpdate {
                    external_customer_id: Some("cus_1".to_string()),
                    subscription_plan: SubscriptionPlan::Basic,
                    subscription_status: SubscriptionStatus::Canceled,
                    last_event_at: None,
                },
            )
            .await
            .unwrap();

        let event = event_at(
            "evt_late",
            1_700_000_000,
            BillingEventKind::PaymentSucceeded(invoice("cus_1")),
        );
        let outcome = h.service.apply_webhook_event(&event).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_unhandled_event_ignored_without_lookup() {
        let h = harness();
        let event = event_at("evt_x", 1_700_000_000, BillingEventKind::Unhandled);
        assert_eq!(
            h.service.apply_webhook_event(&event).await.unwrap(),
            ApplyOutcome::Ignored
        );
    }
}
