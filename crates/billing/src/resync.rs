//! Reconciliation from the payment provider
//!
//! Webhook processing acknowledges even when a delivery could not be applied,
//! so the provider's view is periodically pulled and reapplied through the
//! same state machine as a synthetic event stamped with the current time.

use consultdesk_shared::SubscriptionStatus;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{BillingEvent, BillingEventKind, SubscriptionSnapshot};
use crate::gateway::ProviderSubscription;
use crate::subscriptions::{stamp, ApplyOutcome, SubscriptionService};

/// Counts from a full resync pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResyncSummary {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// The subscription that best describes the customer's current state:
/// the newest live one, otherwise the newest of any status.
fn current_subscription(subscriptions: &[ProviderSubscription]) -> Option<&ProviderSubscription> {
    let live = subscriptions
        .iter()
        .filter(|subscription| {
            !matches!(
                SubscriptionStatus::from_provider(&subscription.status),
                Some(SubscriptionStatus::Canceled) | None
            )
        })
        .max_by_key(|subscription| subscription.created);

    live.or_else(|| {
        subscriptions
            .iter()
            .max_by_key(|subscription| subscription.created)
    })
}

impl SubscriptionService {
    /// Reapply the provider's current subscription state to one organization
    pub async fn resync_from_provider(&self, org_id: Uuid) -> BillingResult<ApplyOutcome> {
        let org = self.load_organization(org_id).await?;
        let Some(customer_id) = org.external_customer_id.clone() else {
            return Ok(ApplyOutcome::Ignored);
        };

        let subscriptions = self.gateway.list_subscriptions(&customer_id).await?;
        let Some(current) = current_subscription(&subscriptions) else {
            tracing::debug!(
                org_id = %org_id,
                customer_id = %customer_id,
                "No provider subscriptions to resync"
            );
            return Ok(ApplyOutcome::Unchanged);
        };

        let now = stamp(OffsetDateTime::now_utc());
        let event = BillingEvent {
            id: format!("resync_{}_{}", org_id, now.unix_timestamp()),
            event_type: "resync".to_string(),
            created: now,
            kind: BillingEventKind::SubscriptionUpdated(SubscriptionSnapshot {
                subscription_id: current.id.clone(),
                customer_id: Some(customer_id),
                status: current.status.clone(),
                price_id: current.price_id.clone(),
                org_id: Some(org_id),
            }),
        };

        self.apply_webhook_event(&event).await
    }

    /// Resync every organization that has a billing customer
    ///
    /// Failures are logged per organization and do not stop the pass.
    pub async fn resync_all(&self) -> BillingResult<ResyncSummary> {
        let organizations = self.ledger.list_organizations().await?;
        let mut summary = ResyncSummary::default();

        for org in organizations
            .iter()
            .filter(|org| org.external_customer_id.is_some())
        {
            summary.checked += 1;
            match self.resync_from_provider(org.id).await {
                Ok(ApplyOutcome::Applied) => summary.updated += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        org_id = %org.id,
                        error = %e,
                        "Failed to resync organization from provider"
                    );
                }
            }
        }

        tracing::info!(
            checked = summary.checked,
            updated = summary.updated,
            failed = summary.failed,
            "Provider resync complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::testing::{test_prices, FakeGateway};
    use consultdesk_shared::{
        BillingUpdate, InMemoryLedgerStore, LedgerStore, Organization, SubscriptionPlan,
    };
    use std::sync::Arc;

    fn provider_sub(id: &str, customer: &str, status: &str, created: i64) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            customer_id: customer.to_string(),
            status: status.to_string(),
            price_id: Some("price_enterprise".to_string()),
            created,
            client_secret: None,
        }
    }

    async fn org_with_customer(ledger: &InMemoryLedgerStore, customer: &str) -> Organization {
        let org = ledger.insert_organization("Acme").await.unwrap();
        ledger
            .update_organization_billing(
                org.id,
                org.version,
                &BillingUpdate {
                    external_customer_id: Some(customer.to_string()),
                    subscription_plan: SubscriptionPlan::Basic,
                    subscription_status: SubscriptionStatus::PastDue,
                    last_event_at: None,
                },
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_current_subscription_prefers_live() {
        let subs = vec![
            provider_sub("sub_old", "cus_1", "active", 10),
            provider_sub("sub_new", "cus_1", "canceled", 20),
        ];
        assert_eq!(current_subscription(&subs).unwrap().id, "sub_old");

        let all_canceled = vec![
            provider_sub("sub_a", "cus_1", "canceled", 10),
            provider_sub("sub_b", "cus_1", "canceled", 20),
        ];
        assert_eq!(current_subscription(&all_canceled).unwrap().id, "sub_b");
        assert!(current_subscription(&[]).is_none());
    }

    #[tokio::test]
    async fn test_resync_applies_provider_state() {
        let gateway = Arc::new(FakeGateway::new());
        let ledger = InMemoryLedgerStore::new();
        let service =
            SubscriptionService::new(gateway.clone(), Arc::new(ledger.clone()), test_prices());

        let org = org_with_customer(&ledger, "cus_1").await;
        gateway.put_subscription(provider_sub("sub_1", "cus_1", "active", 100));

        let outcome = service.resync_from_provider(org.id).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let stored = ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Enterprise);
        assert!(stored.last_event_at.is_some());

        // A second pass finds nothing new to write
        let again = service.resync_from_provider(org.id).await.unwrap();
        assert_ne!(again, ApplyOutcome::Stale);
    }

    #[tokio::test]
    async fn test_resync_all_isolates_failures() {
        let gateway = Arc::new(FakeGateway::new());
        let ledger = InMemoryLedgerStore::new();
        let service =
            SubscriptionService::new(gateway.clone(), Arc::new(ledger.clone()), test_prices());

        org_with_customer(&ledger, "cus_1").await;
        org_with_customer(&ledger, "cus_2").await;
        ledger.insert_organization("No billing yet").await.unwrap();
        gateway.put_subscription(provider_sub("sub_2", "cus_2", "active", 100));

        gateway.fail_next(BillingError::provider("unavailable", true));
        let summary = service.resync_all().await.unwrap();

        assert_eq!(summary.checked, 2);
        assert_eq!(summary.failed, 1);
    }
}
