//! Ledger store
//!
//! Durable records for organizations (billing identity, plan and status),
//! SLA tracking rows, notifications and processed webhook events.
//!
//! Every mutating write to an organization or SLA row is a compare-and-swap on
//! its `version` column. A mismatch surfaces as
//! [`LedgerError::ConcurrencyConflict`] and the caller decides whether to
//! re-read and retry.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{
    NotificationType, ParseEnumError, SlaStatus, SubjectRef, SubscriptionPlan, SubscriptionStatus,
};

/// Ledger error
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} was modified concurrently")]
    ConcurrencyConflict { entity: &'static str, id: String },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::ConcurrencyConflict {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether re-reading and repeating the write may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrencyConflict { .. } | LedgerError::Database(_)
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            // 23xxx: integrity constraint violations (check, unique, foreign key)
            if db.code().is_some_and(|code| code.starts_with("23")) {
                return LedgerError::Constraint(db.message().to_string());
            }
        }
        LedgerError::Database(e.to_string())
    }
}

impl From<ParseEnumError> for LedgerError {
    fn from(e: ParseEnumError) -> Self {
        LedgerError::Database(format!("Corrupt row: {}", e))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Organization billing record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub external_customer_id: Option<String>,
    pub subscription_plan: SubscriptionPlan,
    pub subscription_status: SubscriptionStatus,
    /// Timestamp of the newest provider event (or direct operation) applied
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Organization {
    /// Current billing fields, as a starting point for an update
    pub fn billing(&self) -> BillingUpdate {
        BillingUpdate {
            external_customer_id: self.external_customer_id.clone(),
            subscription_plan: self.subscription_plan,
            subscription_status: self.subscription_status,
            last_event_at: self.last_event_at,
        }
    }
}

/// The full set of billing fields written atomically in one update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingUpdate {
    pub external_customer_id: Option<String>,
    pub subscription_plan: SubscriptionPlan,
    pub subscription_status: SubscriptionStatus,
    pub last_event_at: Option<OffsetDateTime>,
}

impl BillingUpdate {
    /// A subscribed organization must always carry its external customer id
    pub fn check_invariant(&self) -> LedgerResult<()> {
        if self.subscription_status != SubscriptionStatus::None
            && self.external_customer_id.is_none()
        {
            return Err(LedgerError::Constraint(format!(
                "subscription status '{}' requires an external customer id",
                self.subscription_status
            )));
        }
        Ok(())
    }
}

/// Minimal user record needed to address an email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
}

/// SLA commitment on a task, ticket or project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaTracking {
    pub id: Uuid,
    pub subject: SubjectRef,
    #[serde(with = "time::serde::rfc3339")]
    pub target_date: OffsetDateTime,
    pub warning_threshold_hours: i32,
    pub status: SlaStatus,
    pub assigned_user_id: Option<Uuid>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SlaTracking {
    /// Fractional hours until the deadline (negative once passed)
    pub fn hours_until_due(&self, now: OffsetDateTime) -> f64 {
        (self.target_date - now).as_seconds_f64() / 3600.0
    }
}

/// Input for scheduling a new SLA row
#[derive(Debug, Clone)]
pub struct NewSlaTracking {
    pub subject: SubjectRef,
    pub target_date: OffsetDateTime,
    pub warning_threshold_hours: i32,
    pub assigned_user_id: Option<Uuid>,
}

/// In-app notification and its email delivery flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub related_id: Uuid,
    pub is_email_sent: bool,
    /// When the last email attempt started
    #[serde(with = "time::serde::rfc3339::option")]
    pub email_attempted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub related_id: Uuid,
}

/// Processing state of a received webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookProcessingResult {
    Processing,
    Success,
    Error,
}

impl WebhookProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookProcessingResult::Processing => "processing",
            WebhookProcessingResult::Success => "success",
            WebhookProcessingResult::Error => "error",
        }
    }
}

impl std::str::FromStr for WebhookProcessingResult {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(WebhookProcessingResult::Processing),
            "success" => Ok(WebhookProcessingResult::Success),
            "error" => Ok(WebhookProcessingResult::Error),
            other => Err(ParseEnumError {
                kind: "webhook processing result",
                value: other.to_string(),
            }),
        }
    }
}

/// Request to claim exclusive processing of a webhook event
#[derive(Debug, Clone)]
pub struct WebhookEventClaim {
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub payload: String,
    /// A claim stuck in `processing` for longer than this may be taken over
    pub stale_after: time::Duration,
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    #[serde(skip_serializing)]
    pub payload: String,
    pub processing_result: WebhookProcessingResult,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub processing_started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Persistence port for the billing and SLA core
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Organizations

    /// Create an organization with no billing identity (`basic` / `none`).
    ///
    /// Organizations are owned by the dashboard; this exists for that
    /// collaborator and for seeding.
    async fn insert_organization(&self, name: &str) -> LedgerResult<Organization>;

    async fn get_organization(&self, org_id: Uuid) -> LedgerResult<Option<Organization>>;

    async fn find_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> LedgerResult<Option<Organization>>;

    async fn list_organizations(&self) -> LedgerResult<Vec<Organization>>;

    /// Atomically replace all billing fields if the row is still at `expected_version`.
    ///
    /// Fails with `ConcurrencyConflict` on a version mismatch and `Constraint`
    /// if the update would break the customer id invariant.
    async fn update_organization_billing(
        &self,
        org_id: Uuid,
        expected_version: i64,
        update: &BillingUpdate,
    ) -> LedgerResult<Organization>;

    // Users

    async fn get_user_contact(&self, user_id: Uuid) -> LedgerResult<Option<UserContact>>;

    // SLA tracking

    async fn insert_sla_tracking(&self, new: &NewSlaTracking) -> LedgerResult<SlaTracking>;

    async fn get_sla_tracking(&self, id: Uuid) -> LedgerResult<Option<SlaTracking>>;

    /// Rows the escalation engine still has to look at (`on_track` or `at_risk`)
    async fn list_open_sla_trackings(&self) -> LedgerResult<Vec<SlaTracking>>;

    /// Advance a row's status if still at `expected_version`.
    ///
    /// Moving backwards (e.g. `overdue` → `at_risk`) is rejected with `Constraint`.
    async fn update_sla_status(
        &self,
        id: Uuid,
        expected_version: i64,
        status: SlaStatus,
    ) -> LedgerResult<SlaTracking>;

    // Notifications

    /// Insert a notification, stamping its first email attempt.
    ///
    /// For deduplicated types (see [`NotificationType::is_deduplicated`]) the
    /// insert is a no-op returning `None` when a row with the same
    /// `(related_id, type, user_id)` already exists.
    async fn insert_notification(
        &self,
        new: &NewNotification,
    ) -> LedgerResult<Option<Notification>>;

    /// Take the right to retry the email of a deduplicated notification.
    ///
    /// Matches only a row whose email is still unsent and whose last attempt
    /// started before `attempted_before`. The attempt time is set to `now` in
    /// the same step, so concurrent callers get at most one `Some`.
    async fn claim_notification_resend(
        &self,
        related_id: Uuid,
        notification_type: NotificationType,
        user_id: Uuid,
        attempted_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> LedgerResult<Option<Notification>>;

    async fn mark_notification_email_sent(&self, id: Uuid) -> LedgerResult<()>;

    async fn list_notifications_for_related(
        &self,
        related_id: Uuid,
        notification_type: NotificationType,
    ) -> LedgerResult<Vec<Notification>>;

    async fn list_notifications_by_type(
        &self,
        notification_type: NotificationType,
    ) -> LedgerResult<Vec<Notification>>;

    // Webhook events

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// Returns `false` if the event was already processed or is being
    /// processed by someone else (and that claim is not stale).
    async fn claim_webhook_event(&self, claim: &WebhookEventClaim) -> LedgerResult<bool>;

    async fn get_webhook_event(&self, event_id: &str) -> LedgerResult<Option<WebhookEventRecord>>;

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookProcessingResult,
        error_message: Option<&str>,
    ) -> LedgerResult<()>;

    async fn list_failed_webhook_events(&self, limit: i64)
        -> LedgerResult<Vec<WebhookEventRecord>>;

    /// Delete event records created before `older_than`. Returns rows removed.
    async fn purge_webhook_events(&self, older_than: OffsetDateTime) -> LedgerResult<u64>;
}
