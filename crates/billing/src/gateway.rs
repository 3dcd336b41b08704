//! Payment gateway port and the Stripe adapter
//!
//! The [`PaymentGateway`] trait is the only way the billing core talks to the
//! payment provider. Implementations translate provider responses into the
//! types below and into [`BillingError`]; no provider type crosses this
//! boundary. Adapters perform no retries of their own.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use stripe::generated::billing::subscription::{
    SubscriptionPaymentBehavior, SubscriptionProrationBehavior, SubscriptionStatusFilter,
};
use stripe::{
    AttachPaymentMethod, CancelSubscription, CreateCustomer, CreatePaymentIntent,
    CreateSubscription, CreateSubscriptionItems, Currency, Customer, CustomerId, Expandable,
    ListSubscriptions, PaymentIntent, PaymentMethod, PaymentMethodId, Subscription, SubscriptionId,
    UpdateSubscription, UpdateSubscriptionItems,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Request to open a subscription for an existing customer
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub org_id: Uuid,
    pub customer_id: String,
    pub price_id: String,
    pub default_payment_method: Option<String>,
}

/// Subscription as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    /// Provider status string (e.g. `active`, `incomplete`, `trialing`)
    pub status: String,
    pub price_id: Option<String>,
    /// Unix seconds
    pub created: i64,
    /// Secret the client needs to confirm the first payment, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Payment intent handle returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentHandle {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: String,
}

/// Narrow typed client over the payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a customer and return its provider id
    async fn create_customer(&self, org_id: Uuid, email: &str, name: &str)
        -> BillingResult<String>;

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Create a subscription whose first payment is left incomplete for the client to confirm
    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> BillingResult<ProviderSubscription>;

    async fn cancel_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Swap the subscription's price item, prorating the difference
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    async fn create_payment_intent(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<PaymentIntentHandle>;

    /// All subscriptions (any status) for a customer
    async fn list_subscriptions(&self, customer_id: &str)
        -> BillingResult<Vec<ProviderSubscription>>;
}

/// Stripe implementation of [`PaymentGateway`]
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Run a Stripe call under the configured timeout
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        let timeout = self.stripe.config().timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let err = BillingError::from(e);
                tracing::warn!(operation, error = %err, "Stripe call failed");
                Err(err)
            }
            Err(_) => {
                tracing::warn!(
                    operation,
                    timeout_secs = timeout.as_secs(),
                    "Stripe call timed out"
                );
                Err(BillingError::provider(
                    format!("{} timed out after {:?}", operation, timeout),
                    true,
                ))
            }
        }
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::Validation(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
    subscription_id
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::Validation(format!("Invalid subscription ID: {}", e)))
}

/// Pull the first payment's client secret out of an expanded latest invoice
fn first_payment_secret(subscription: &Subscription) -> Option<String> {
    let invoice = match subscription.latest_invoice.as_ref()? {
        Expandable::Object(invoice) => invoice,
        Expandable::Id(_) => return None,
    };
    match invoice.payment_intent.as_ref()? {
        Expandable::Object(intent) => intent.client_secret.clone(),
        Expandable::Id(_) => None,
    }
}

fn to_provider_subscription(subscription: &Subscription) -> ProviderSubscription {
    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_id: subscription.customer.id().to_string(),
        status: subscription.status.as_str().to_string(),
        price_id: subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string()),
        created: subscription.created,
        client_secret: first_payment_secret(subscription),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(
        &self,
        org_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("platform".to_string(), "consultdesk".to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = self
            .call(
                "create_customer",
                Customer::create(self.stripe.inner(), params),
            )
            .await?;

        Ok(customer.id.to_string())
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let customer = parse_customer_id(customer_id)?;
        let payment_method = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::Validation(format!("Invalid payment method ID: {}", e)))?;

        self.call(
            "attach_payment_method",
            PaymentMethod::attach(
                self.stripe.inner(),
                &payment_method,
                AttachPaymentMethod { customer },
            ),
        )
        .await?;

        Ok(())
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> BillingResult<ProviderSubscription> {
        let customer = parse_customer_id(&request.customer_id)?;

        let mut metadata = HashMap::new();
        metadata.insert("org_id".to_string(), request.org_id.to_string());

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.default_payment_method = request.default_payment_method.as_deref();
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = self
            .call(
                "create_subscription",
                Subscription::create(self.stripe.inner(), params),
            )
            .await?;

        Ok(to_provider_subscription(&subscription))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = self
            .call(
                "cancel_subscription",
                Subscription::cancel(self.stripe.inner(), &sub_id, params),
            )
            .await?;

        Ok(to_provider_subscription(&subscription))
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        // Current subscription to get the item ID
        let current = self
            .call(
                "retrieve_subscription",
                Subscription::retrieve(self.stripe.inner(), &sub_id, &[]),
            )
            .await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::provider(
                    format!("Subscription {} has no items", subscription_id),
                    false,
                )
            })?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let subscription = self
            .call(
                "update_subscription",
                Subscription::update(self.stripe.inner(), &sub_id, params),
            )
            .await?;

        Ok(to_provider_subscription(&subscription))
    }

    async fn create_payment_intent(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<PaymentIntentHandle> {
        let customer = parse_customer_id(customer_id)?;
        let currency: Currency =
            serde_json::from_value(serde_json::Value::String(currency.to_ascii_lowercase()))
                .map_err(|_| {
                    BillingError::Validation(format!("Unsupported currency: {}", currency))
                })?;

        let mut params = CreatePaymentIntent::new(amount_cents, currency);
        params.customer = Some(customer);

        let intent = self
            .call(
                "create_payment_intent",
                PaymentIntent::create(self.stripe.inner(), params),
            )
            .await?;

        Ok(PaymentIntentHandle {
            id: intent.id.to_string(),
            client_secret: intent.client_secret,
            status: intent.status.as_str().to_string(),
        })
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let customer = parse_customer_id(customer_id)?;

        let params = ListSubscriptions {
            customer: Some(customer),
            status: Some(SubscriptionStatusFilter::All),
            ..Default::default()
        };

        let subscriptions = self
            .call(
                "list_subscriptions",
                Subscription::list(self.stripe.inner(), &params),
            )
            .await?;

        Ok(subscriptions
            .data
            .iter()
            .map(to_provider_subscription)
            .collect())
    }
}
