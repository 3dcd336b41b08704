//! Stripe client and configuration

use std::sync::Arc;
use std::time::Duration;

use consultdesk_shared::SubscriptionPlan;

use crate::error::{BillingError, BillingResult};

/// Stripe price IDs for each plan
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub basic: String,
    pub professional: String,
    pub enterprise: String,
}

impl PriceIds {
    /// Map a provider price id onto the internal plan code
    pub fn plan_for_price(&self, price_id: &str) -> Option<SubscriptionPlan> {
        if price_id == self.basic {
            Some(SubscriptionPlan::Basic)
        } else if price_id == self.professional {
            Some(SubscriptionPlan::Professional)
        } else if price_id == self.enterprise {
            Some(SubscriptionPlan::Enterprise)
        } else {
            None
        }
    }

    pub fn price_for_plan(&self, plan: SubscriptionPlan) -> &str {
        match plan {
            SubscriptionPlan::Basic => &self.basic,
            SubscriptionPlan::Professional => &self.professional,
            SubscriptionPlan::Enterprise => &self.enterprise,
        }
    }
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    /// Upper bound on every Stripe API call
    pub timeout: Duration,
    /// Maximum age of a webhook signature timestamp
    pub webhook_tolerance: Duration,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds {
                basic: required_env("STRIPE_PRICE_BASIC")?,
                professional: required_env("STRIPE_PRICE_PROFESSIONAL")?,
                enterprise: required_env("STRIPE_PRICE_ENTERPRISE")?,
            },
            timeout: Duration::from_secs(env_secs("STRIPE_TIMEOUT_SECS", 10)?),
            webhook_tolerance: Duration::from_secs(env_secs("STRIPE_WEBHOOK_TOLERANCE_SECS", 300)?),
        })
    }
}

fn required_env(key: &str) -> BillingResult<String> {
    std::env::var(key).map_err(|_| BillingError::Config(format!("{} not set", key)))
}

fn env_secs(key: &str, default: u64) -> BillingResult<u64> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| BillingError::Config(format!("{} must be a number of seconds", key))),
        Err(_) => Ok(default),
    }
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices() -> PriceIds {
        PriceIds {
            basic: "price_basic".into(),
            professional: "price_professional".into(),
            enterprise: "price_enterprise".into(),
        }
    }

    #[test]
    fn test_plan_for_price() {
        let prices = prices();
        assert_eq!(
            prices.plan_for_price("price_professional"),
            Some(SubscriptionPlan::Professional)
        );
        assert_eq!(prices.plan_for_price("price_unknown"), None);
        assert_eq!(
            prices.price_for_plan(SubscriptionPlan::Enterprise),
            "price_enterprise"
        );
    }
}
