//! Ledger invariants
//!
//! Runnable consistency checks over the ledger. They only read, so they can
//! be run at any time: after a replay, after a resync, or on a schedule.
//!
//! ## Checks
//!
//! 1. **customer_required_for_status**: a subscribed organization has an external customer id
//! 2. **single_sent_sla_warning**: at most one sent SLA warning per (row, user)
//! 3. **overdue_sla_marked**: no open SLA row is left past its deadline for
//!    longer than two scan periods

use std::collections::HashMap;
use std::sync::Arc;

use consultdesk_shared::{LedgerStore, NotificationType, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Rows affected (organization, SLA or notification ids)
    pub record_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - billing state contradicts itself
    Critical,
    /// High - a user-visible guarantee was broken
    High,
    /// Medium - a scheduled job appears to be behind
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 3] = [
    "customer_required_for_status",
    "single_sent_sla_warning",
    "overdue_sla_marked",
];

/// Service for running ledger invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    ledger: Arc<dyn LedgerStore>,
    /// Cadence of the SLA scan; rows may lag by up to two of these
    scan_period: time::Duration,
}

impl InvariantChecker {
    pub fn new(ledger: Arc<dyn LedgerStore>, scan_period: time::Duration) -> Self {
        Self {
            ledger,
            scan_period,
        }
    }

    pub fn ledger(&self) -> Arc<dyn LedgerStore> {
        self.ledger.clone()
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        self.run_all_checks_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_all_checks_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check_at(name, now).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        self.run_check_at(name, OffsetDateTime::now_utc()).await
    }

    async fn run_check_at(
        &self,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "customer_required_for_status" => self.check_customer_required_for_status().await,
            "single_sent_sla_warning" => self.check_single_sent_sla_warning().await,
            "overdue_sla_marked" => self.check_overdue_sla_marked(now).await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// Invariant 1: `subscription_status != none` implies an external customer id
    async fn check_customer_required_for_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let organizations = self.ledger.list_organizations().await?;

        Ok(organizations
            .into_iter()
            .filter(|org| {
                org.subscription_status != SubscriptionStatus::None
                    && org.external_customer_id.is_none()
            })
            .map(|org| InvariantViolation {
                invariant: "customer_required_for_status".to_string(),
                record_ids: vec![org.id],
                description: format!(
                    "Organization is '{}' but has no external customer id",
                    org.subscription_status
                ),
                context: serde_json::json!({
                    "org_name": org.name,
                    "subscription_status": org.subscription_status,
                    "subscription_plan": org.subscription_plan,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: no duplicate warning emails for one SLA row and user
    async fn check_single_sent_sla_warning(&self) -> BillingResult<Vec<InvariantViolation>> {
        let warnings = self
            .ledger
            .list_notifications_by_type(NotificationType::SlaWarning)
            .await?;

        let mut sent: HashMap<(Uuid, Uuid), Vec<Uuid>> = HashMap::new();
        for notification in warnings.iter().filter(|n| n.is_email_sent) {
            sent.entry((notification.related_id, notification.user_id))
                .or_default()
                .push(notification.id);
        }

        Ok(sent
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|((related_id, user_id), ids)| InvariantViolation {
                invariant: "single_sent_sla_warning".to_string(),
                description: format!(
                    "{} SLA warning emails sent for the same row and user",
                    ids.len()
                ),
                context: serde_json::json!({
                    "sla_tracking_id": related_id,
                    "user_id": user_id,
                }),
                record_ids: ids,
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: the escalation scan keeps up with deadlines
    async fn check_overdue_sla_marked(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = now - self.scan_period * 2;
        let open = self.ledger.list_open_sla_trackings().await?;

        Ok(open
            .into_iter()
            .filter(|row| row.target_date < cutoff)
            .map(|row| InvariantViolation {
                invariant: "overdue_sla_marked".to_string(),
                record_ids: vec![row.id],
                description: format!(
                    "SLA row still '{}' {} minutes after its deadline",
                    row.status,
                    (now - row.target_date).whole_minutes()
                ),
                context: serde_json::json!({
                    "subject": row.subject,
                    "target_date": row.target_date.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
