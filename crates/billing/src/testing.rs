//! In-process payment gateway for tests
//!
//! Keeps customers and subscriptions in memory, records the name of every
//! call, and can be told to fail the next call.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, PaymentIntentHandle, ProviderSubscription, SubscriptionRequest};

/// Price table used throughout the tests
pub fn test_prices() -> PriceIds {
    PriceIds {
        basic: "price_basic".to_string(),
        professional: "price_professional".to_string(),
        enterprise: "price_enterprise".to_string(),
    }
}

#[derive(Default)]
struct FakeState {
    counter: u32,
    calls: Vec<String>,
    subscriptions: HashMap<String, ProviderSubscription>,
    next_status: Option<String>,
    fail_next: Option<BillingError>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{:06}", prefix, self.counter)
    }

    /// Record the call, then fail it if a failure was queued
    fn enter(&mut self, call: &str) -> BillingResult<()> {
        self.calls.push(call.to_string());
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Names of the gateway calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Status reported by the next `create_subscription` (default `incomplete`)
    pub fn set_next_subscription_status(&self, status: &str) {
        self.state().next_status = Some(status.to_string());
    }

    pub fn fail_next(&self, err: BillingError) {
        self.state().fail_next = Some(err);
    }

    /// Seed or overwrite a subscription as the provider would report it
    pub fn put_subscription(&self, subscription: ProviderSubscription) {
        self.state()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(
        &self,
        _org_id: Uuid,
        _email: &str,
        _name: &str,
    ) -> BillingResult<String> {
        let mut state = self.state();
        state.enter("create_customer")?;
        Ok(state.next_id("cus"))
    }

    async fn attach_payment_method(
        &self,
        _customer_id: &str,
        _payment_method_id: &str,
    ) -> BillingResult<()> {
        self.state().enter("attach_payment_method")
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state();
        state.enter("create_subscription")?;
        let id = state.next_id("sub");
        let secret = format!("{}_secret", state.next_id("pi"));
        let status = state
            .next_status
            .take()
            .unwrap_or_else(|| "incomplete".to_string());
        let subscription = ProviderSubscription {
            id: id.clone(),
            customer_id: request.customer_id.clone(),
            status,
            price_id: Some(request.price_id.clone()),
            created: 1_700_000_000 + i64::from(state.counter),
            client_secret: Some(secret),
        };
        state.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state();
        state.enter("cancel_subscription")?;
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::provider("No such subscription", false))?;
        subscription.status = "canceled".to_string();
        Ok(subscription.clone())
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.state();
        state.enter("update_subscription_price")?;
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::provider("No such subscription", false))?;
        subscription.price_id = Some(price_id.to_string());
        Ok(subscription.clone())
    }

    async fn create_payment_intent(
        &self,
        _customer_id: &str,
        _amount_cents: i64,
        _currency: &str,
    ) -> BillingResult<PaymentIntentHandle> {
        let mut state = self.state();
        state.enter("create_payment_intent")?;
        let id = state.next_id("pi");
        Ok(PaymentIntentHandle {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status: "requires_payment_method".to_string(),
        })
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let mut state = self.state();
        state.enter("list_subscriptions")?;
        let mut subscriptions: Vec<ProviderSubscription> = state
            .subscriptions
            .values()
            .filter(|subscription| subscription.customer_id == customer_id)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|subscription| subscription.created);
        Ok(subscriptions)
    }
}
