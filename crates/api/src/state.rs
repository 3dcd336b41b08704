//! Application state

use std::sync::Arc;

use consultdesk_billing::BillingService;
use consultdesk_notifications::{NotificationService, SlaEscalationEngine};
use consultdesk_shared::LedgerStore;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    /// Billing service (None when Stripe is not configured or billing is disabled)
    pub billing: Option<Arc<BillingService>>,
    /// Notification triggers (None when email is not configured)
    pub notifications: Option<NotificationService>,
    pub escalation: Option<SlaEscalationEngine>,
}

impl AppState {
    /// Build state from environment configuration
    ///
    /// Billing and email are optional: a missing provider configuration is
    /// logged and the corresponding routes answer 503.
    pub fn new(ledger: Arc<dyn LedgerStore>, config: &Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(ledger.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        let (notifications, escalation) = match consultdesk_notifications::from_env(ledger.clone())
        {
            Ok((notifications, escalation)) => {
                tracing::info!("Email notifications enabled");
                (Some(notifications), Some(escalation))
            }
            Err(e) => {
                tracing::warn!("Email notifications not configured: {}", e);
                (None, None)
            }
        };

        Self {
            ledger,
            billing,
            notifications,
            escalation,
        }
    }

    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing
            .as_deref()
            .ok_or(ApiError::NotConfigured("Billing"))
    }

    pub fn notifications(&self) -> ApiResult<&NotificationService> {
        self.notifications
            .as_ref()
            .ok_or(ApiError::NotConfigured("Email notifications"))
    }

    pub fn escalation(&self) -> ApiResult<&SlaEscalationEngine> {
        self.escalation
            .as_ref()
            .ok_or(ApiError::NotConfigured("Email notifications"))
    }
}
