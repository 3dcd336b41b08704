// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ConsultDesk Shared Types
//!
//! Domain types and the ledger store shared by the billing, notification,
//! API and worker crates.
//!
//! ## Contents
//!
//! - **Types**: subscription plans/statuses, SLA statuses, notification types
//! - **Ledger**: the `LedgerStore` trait with PostgreSQL and in-memory implementations
//! - **Database**: pool creation and embedded migrations

pub mod db;
pub mod ledger;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use ledger::{
    BillingUpdate, InMemoryLedgerStore, LedgerError, LedgerResult, LedgerStore, NewNotification,
    NewSlaTracking, Notification, Organization, PgLedgerStore, SlaTracking, UserContact,
    WebhookEventClaim, WebhookEventRecord, WebhookProcessingResult,
};
pub use types::{
    NotificationType, ParseEnumError, SlaStatus, SubjectRef, SubscriptionPlan, SubscriptionStatus,
};
