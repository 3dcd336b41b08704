// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing State
//!
//! Tests boundary conditions and races in:
//! - Concurrent duplicate webhook deliveries
//! - Out-of-order provider events
//! - Concurrent writers on one organization
//! - Recovery of stuck webhook claims

#[cfg(test)]
mod support {
    use std::sync::Arc;
    use std::time::Duration;

    use consultdesk_shared::{
        BillingUpdate, InMemoryLedgerStore, LedgerStore, Organization, SubscriptionStatus,
    };
    use time::OffsetDateTime;

    use crate::events::{BillingEvent, BillingEventKind, SubscriptionSnapshot};
    use crate::signature::StripeSignatureVerifier;
    use crate::subscriptions::SubscriptionService;
    use crate::testing::{test_prices, FakeGateway};
    use crate::webhooks::WebhookHandler;

    pub struct Harness {
        pub service: SubscriptionService,
        pub handler: WebhookHandler,
        pub ledger: InMemoryLedgerStore,
    }

    pub fn harness() -> Harness {
        let ledger = InMemoryLedgerStore::new();
        let shared: Arc<dyn LedgerStore> = Arc::new(ledger.clone());
        let service =
            SubscriptionService::new(Arc::new(FakeGateway::new()), shared.clone(), test_prices());
        let verifier = StripeSignatureVerifier::new("whsec_edge", Duration::from_secs(300));
        Harness {
            handler: WebhookHandler::new(Arc::new(verifier), service.clone(), shared),
            service,
            ledger,
        }
    }

    pub async fn active_org(ledger: &InMemoryLedgerStore, customer: &str) -> Organization {
        let org = ledger.insert_organization("Acme").await.unwrap();
        ledger
            .update_organization_billing(
                org.id,
                org.version,
                &BillingUpdate {
                    external_customer_id: Some(customer.to_string()),
                    subscription_status: SubscriptionStatus::Active,
                    ..org.billing()
                },
            )
            .await
            .unwrap()
    }

    pub fn updated(id: &str, created: i64, customer: &str, price: &str) -> BillingEvent {
        BillingEvent {
            id: id.to_string(),
            event_type: "customer.subscription.updated".to_string(),
            created: OffsetDateTime::from_unix_timestamp(created).unwrap(),
            kind: BillingEventKind::SubscriptionUpdated(SubscriptionSnapshot {
                subscription_id: "sub_1".to_string(),
                customer_id: Some(customer.to_string()),
                status: "active".to_string(),
                price_id: Some(price.to_string()),
                org_id: None,
            }),
        }
    }
}

#[cfg(test)]
mod duplicate_delivery_tests {
    use super::support::*;
    use crate::subscriptions::ApplyOutcome;
    use crate::webhooks::WebhookDisposition;
    use consultdesk_shared::{LedgerStore, SubscriptionPlan, WebhookProcessingResult};

    // =========================================================================
    // Eight concurrent deliveries of one event: exactly one applies it
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_apply_once() {
        let h = harness();
        let org = active_org(&h.ledger, "cus_dup").await;
        let event = updated("evt_dup", 1_700_000_000, "cus_dup", "price_enterprise");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handler = h.handler.clone();
            let event = event.clone();
            tasks.push(tokio::spawn(async move {
                handler.handle_event(&event, "{}").await.unwrap()
            }));
        }

        let mut processed = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                WebhookDisposition::Processed(ApplyOutcome::Applied) => processed += 1,
                WebhookDisposition::Duplicate => duplicates += 1,
                other => panic!("unexpected disposition {:?}", other),
            }
        }
        assert_eq!(processed, 1);
        assert_eq!(duplicates, 7);

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Enterprise);
        assert_eq!(stored.version, org.version + 1);

        let record = h.ledger.get_webhook_event("evt_dup").await.unwrap().unwrap();
        assert_eq!(record.processing_result, WebhookProcessingResult::Success);
    }

    // =========================================================================
    // Redelivery after success is acknowledged without touching the ledger
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_after_success_is_noop() {
        let h = harness();
        let org = active_org(&h.ledger, "cus_redeliver").await;
        let event = updated("evt_again", 1_700_000_000, "cus_redeliver", "price_professional");

        let first = h.handler.handle_event(&event, "{}").await.unwrap();
        assert_eq!(first, WebhookDisposition::Processed(ApplyOutcome::Applied));
        let after_first = h.ledger.get_organization(org.id).await.unwrap().unwrap();

        let second = h.handler.handle_event(&event, "{}").await.unwrap();
        assert_eq!(second, WebhookDisposition::Duplicate);
        let after_second = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
    }
}

#[cfg(test)]
mod ordering_tests {
    use super::support::*;
    use crate::events::{BillingEvent, BillingEventKind, InvoiceSnapshot, SubscriptionSnapshot};
    use crate::subscriptions::ApplyOutcome;
    use consultdesk_shared::{LedgerStore, SubscriptionPlan, SubscriptionStatus};
    use time::OffsetDateTime;

    fn at(created: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(created).unwrap()
    }

    // =========================================================================
    // An older update delivered after a newer one is skipped
    // =========================================================================
    #[tokio::test]
    async fn test_older_update_after_newer_is_stale() {
        let h = harness();
        let org = active_org(&h.ledger, "cus_order").await;

        let newer = updated("evt_new", 1_700_000_200, "cus_order", "price_professional");
        let older = updated("evt_old", 1_700_000_100, "cus_order", "price_enterprise");

        assert_eq!(
            h.service.apply_webhook_event(&newer).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            h.service.apply_webhook_event(&older).await.unwrap(),
            ApplyOutcome::Stale
        );

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Professional);
        assert_eq!(stored.last_event_at, Some(at(1_700_000_200)));
    }

    // =========================================================================
    // Events sharing a timestamp are both applied, in delivery order
    // =========================================================================
    #[tokio::test]
    async fn test_equal_timestamps_apply_in_delivery_order() {
        let h = harness();
        let org = active_org(&h.ledger, "cus_tie").await;

        let first = updated("evt_a", 1_700_000_000, "cus_tie", "price_enterprise");
        let second = updated("evt_b", 1_700_000_000, "cus_tie", "price_professional");

        h.service.apply_webhook_event(&first).await.unwrap();
        assert_eq!(
            h.service.apply_webhook_event(&second).await.unwrap(),
            ApplyOutcome::Applied
        );

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Professional);
    }

    // =========================================================================
    // Deleted then a later payment failure: stays canceled
    // =========================================================================
    #[tokio::test]
    async fn test_payment_failure_after_delete_does_not_reopen() {
        let h = harness();
        let org = active_org(&h.ledger, "cus_gone").await;

        let deleted = BillingEvent {
            id: "evt_del".to_string(),
            event_type: "customer.subscription.deleted".to_string(),
            created: at(1_700_000_100),
            kind: BillingEventKind::SubscriptionDeleted(SubscriptionSnapshot {
                subscription_id: "sub_1".to_string(),
                customer_id: Some("cus_gone".to_string()),
                status: "canceled".to_string(),
                ..Default::default()
            }),
        };
        let failed = BillingEvent {
            id: "evt_fail".to_string(),
            event_type: "invoice.payment_failed".to_string(),
            created: at(1_700_000_200),
            kind: BillingEventKind::PaymentFailed(InvoiceSnapshot {
                invoice_id: Some("in_1".to_string()),
                customer_id: Some("cus_gone".to_string()),
                subscription_id: Some("sub_1".to_string()),
                org_id: None,
            }),
        };

        h.service.apply_webhook_event(&deleted).await.unwrap();
        assert_eq!(
            h.service.apply_webhook_event(&failed).await.unwrap(),
            ApplyOutcome::Ignored
        );

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Basic);
    }

    // =========================================================================
    // A stale event is still stale after a direct cancel stamped "now"
    // =========================================================================
    #[tokio::test]
    async fn test_event_older_than_direct_cancel_is_stale() {
        let h = harness();
        let org = h.ledger.insert_organization("Acme").await.unwrap();
        h.service
            .create_customer(org.id, "billing@acme.test", "Acme")
            .await
            .unwrap();
        let handle = h
            .service
            .create_subscription(org.id, "price_professional", None)
            .await
            .unwrap();
        h.service
            .cancel_subscription(org.id, &handle.subscription_id)
            .await
            .unwrap();

        let customer = h
            .ledger
            .get_organization(org.id)
            .await
            .unwrap()
            .unwrap()
            .external_customer_id
            .unwrap();
        let late = updated("evt_late", 1_600_000_000, &customer, "price_enterprise");

        assert_eq!(
            h.service.apply_webhook_event(&late).await.unwrap(),
            ApplyOutcome::Stale
        );
        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::support::*;
    use consultdesk_shared::{LedgerStore, SubscriptionPlan};
    use time::OffsetDateTime;

    // =========================================================================
    // Concurrent writers on one organization: version conflicts are retried
    // and the newest event wins regardless of completion order
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_events_converge_on_newest() {
        let h = harness();
        let org = active_org(&h.ledger, "cus_race").await;

        let prices = [
            "price_basic",
            "price_enterprise",
            "price_professional",
            "price_enterprise",
        ];
        let mut tasks = Vec::new();
        for (i, price) in prices.iter().enumerate() {
            let service = h.service.clone();
            let event = updated(
                &format!("evt_race_{}", i),
                1_700_000_000 + i as i64,
                "cus_race",
                price,
            );
            tasks.push(tokio::spawn(async move {
                service.apply_webhook_event(&event).await
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let stored = h.ledger.get_organization(org.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Enterprise);
        assert_eq!(
            stored.last_event_at,
            Some(OffsetDateTime::from_unix_timestamp(1_700_000_003).unwrap())
        );
    }
}

#[cfg(test)]
mod stuck_claim_tests {
    use super::support::*;
    use crate::subscriptions::ApplyOutcome;
    use crate::webhooks::{WebhookDisposition, PROCESSING_TIMEOUT};
    use consultdesk_shared::{LedgerStore, WebhookEventClaim, WebhookProcessingResult};
    use time::OffsetDateTime;

    fn claim(event_id: &str) -> WebhookEventClaim {
        WebhookEventClaim {
            event_id: event_id.to_string(),
            event_type: "customer.subscription.updated".to_string(),
            event_timestamp: OffsetDateTime::now_utc(),
            payload: "{}".to_string(),
            stale_after: PROCESSING_TIMEOUT,
        }
    }

    // =========================================================================
    // A claim left in processing past the timeout is taken over
    // =========================================================================
    #[tokio::test]
    async fn test_stuck_claim_is_recovered() {
        let h = harness();
        active_org(&h.ledger, "cus_stuck").await;
        assert!(h.ledger.claim_webhook_event(&claim("evt_stuck")).await.unwrap());
        h.ledger
            .set_webhook_event_created_at(
                "evt_stuck",
                OffsetDateTime::now_utc() - PROCESSING_TIMEOUT - time::Duration::minutes(1),
            )
            .await;

        let event = updated("evt_stuck", 1_700_000_000, "cus_stuck", "price_enterprise");
        let disposition = h.handler.handle_event(&event, "{}").await.unwrap();
        assert_eq!(
            disposition,
            WebhookDisposition::Processed(ApplyOutcome::Applied)
        );

        let record = h.ledger.get_webhook_event("evt_stuck").await.unwrap().unwrap();
        assert_eq!(record.processing_result, WebhookProcessingResult::Success);
    }

    // =========================================================================
    // A claim still within the timeout blocks other deliveries
    // =========================================================================
    #[tokio::test]
    async fn test_fresh_claim_blocks_redelivery() {
        let h = harness();
        active_org(&h.ledger, "cus_busy").await;
        assert!(h.ledger.claim_webhook_event(&claim("evt_busy")).await.unwrap());

        let event = updated("evt_busy", 1_700_000_000, "cus_busy", "price_enterprise");
        let disposition = h.handler.handle_event(&event, "{}").await.unwrap();
        assert_eq!(disposition, WebhookDisposition::Duplicate);

        let record = h.ledger.get_webhook_event("evt_busy").await.unwrap().unwrap();
        assert_eq!(record.processing_result, WebhookProcessingResult::Processing);
    }
}
