// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages by value
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ConsultDesk Billing Module
//!
//! Keeps each organization's subscription state consistent with the payment
//! provider, whether it changes through a direct request or an inbound webhook.
//!
//! ## Features
//!
//! - **Payment Gateway**: Stripe customers, subscriptions and payment intents behind a trait
//! - **Subscription State**: create, cancel, change plan, read status
//! - **Webhooks**: signature verification, exactly-once processing, replay of failures
//! - **Resync**: pull the provider's view and reapply it
//! - **Invariants**: runnable consistency checks over the ledger

pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod resync;
pub mod retry;
pub mod signature;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, BillingEventKind, InvoiceSnapshot, SubscriptionSnapshot};

// Gateway
pub use gateway::{
    PaymentGateway, PaymentIntentHandle, ProviderSubscription, StripeGateway, SubscriptionRequest,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Resync
pub use resync::ResyncSummary;

// Signature
pub use signature::{SignatureVerifier, StripeSignatureVerifier};

// Subscriptions
pub use subscriptions::{
    ApplyOutcome, SubscriptionHandle, SubscriptionService, SubscriptionStatusView,
};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookHandler, WebhookReplayResult, PROCESSING_TIMEOUT};

use std::sync::Arc;

use consultdesk_shared::LedgerStore;

/// Cadence assumed by the SLA invariant when none is configured
pub const DEFAULT_SLA_SCAN_PERIOD: time::Duration = time::Duration::minutes(10);

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(ledger: Arc<dyn LedgerStore>) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, ledger))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, ledger: Arc<dyn LedgerStore>) -> Self {
        let verifier = StripeSignatureVerifier::new(
            config.webhook_secret.clone(),
            config.webhook_tolerance,
        );
        let prices = config.price_ids.clone();
        let gateway = StripeGateway::new(StripeClient::new(config));

        Self::with_parts(Arc::new(gateway), Arc::new(verifier), prices, ledger)
    }

    /// Assemble the service from explicit ports
    pub fn with_parts(
        gateway: Arc<dyn PaymentGateway>,
        verifier: Arc<dyn SignatureVerifier>,
        prices: PriceIds,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        let subscriptions = SubscriptionService::new(gateway, ledger.clone(), prices);

        Self {
            webhooks: WebhookHandler::new(verifier, subscriptions.clone(), ledger.clone()),
            invariants: InvariantChecker::new(ledger, DEFAULT_SLA_SCAN_PERIOD),
            subscriptions,
        }
    }

    /// Replace the SLA scan period used by the invariant checks
    pub fn with_sla_scan_period(mut self, scan_period: time::Duration) -> Self {
        self.invariants = InvariantChecker::new(self.invariants.ledger(), scan_period);
        self
    }
}
