// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ConsultDesk Notifications
//!
//! Email delivery and deadline escalation.
//!
//! ## Features
//!
//! - **Email Gateway**: Resend API client behind the `EmailGateway` trait
//! - **Templates**: subject, text and HTML bodies for each notification type
//! - **Triggers**: task assignment, project update and ticket notifications
//! - **SLA Escalation**: scheduled scan that warns before and marks after a deadline

pub mod email;
pub mod error;
pub mod escalation;
pub mod service;
pub mod templates;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use email::{EmailConfig, EmailGateway, OutgoingEmail, ResendEmailService};
pub use error::{NotificationError, NotificationResult};
pub use escalation::{ScanResult, SlaEscalationEngine};
pub use service::{
    Delivery, NotificationService, ProjectUpdate, TaskAssignment, TicketNotice, EMAIL_RETRY_AFTER,
};
pub use templates::EmailContent;

use std::sync::Arc;

use consultdesk_shared::LedgerStore;

/// Build the notification service and escalation engine over one email gateway
pub fn build(
    ledger: Arc<dyn LedgerStore>,
    email: Arc<dyn EmailGateway>,
    dashboard_url: &str,
) -> (NotificationService, SlaEscalationEngine) {
    let notifications = NotificationService::new(ledger.clone(), email, dashboard_url);
    let escalation = SlaEscalationEngine::new(ledger, notifications.clone());
    (notifications, escalation)
}

/// Build both services from environment configuration (Resend)
pub fn from_env(
    ledger: Arc<dyn LedgerStore>,
) -> NotificationResult<(NotificationService, SlaEscalationEngine)> {
    let resend = ResendEmailService::from_env()?;
    let dashboard_url = resend.config().dashboard_url.clone();
    Ok(build(ledger, Arc::new(resend), &dashboard_url))
}
