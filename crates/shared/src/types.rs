//! Domain enums shared across crates
//!
//! Every enum here is persisted as lowercase snake_case text, so `as_str()`
//! and `FromStr` must stay in sync with the CHECK constraints in the migrations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a persisted or inbound string is not a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Subscription plan an organization is billed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    #[default]
    Basic,
    Professional,
    Enterprise,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Basic => "basic",
            SubscriptionPlan::Professional => "professional",
            SubscriptionPlan::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionPlan {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(SubscriptionPlan::Basic),
            "professional" => Ok(SubscriptionPlan::Professional),
            "enterprise" => Ok(SubscriptionPlan::Enterprise),
            other => Err(ParseEnumError::new("subscription plan", other)),
        }
    }
}

/// Local subscription status of an organization
///
/// `None` means the organization has never subscribed. Any other value
/// requires an external customer id on the organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Incomplete,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a payment provider's subscription status onto the local state machine
    ///
    /// Provider states without a local counterpart are folded into the closest
    /// billing meaning: trials grant access, unpaid/paused behave as past due,
    /// and an expired incomplete subscription is treated as canceled.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" | "paused" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionStatus::None),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(ParseEnumError::new("subscription status", other)),
        }
    }
}

/// Risk state of an SLA commitment
///
/// Ordered: a row only ever moves forward (`OnTrack` → `AtRisk` → `Overdue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTrack,
    AtRisk,
    Overdue,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaStatus::OnTrack => "on_track",
            SlaStatus::AtRisk => "at_risk",
            SlaStatus::Overdue => "overdue",
        }
    }

    /// Position in the escalation order, mirrored by the SQL guard in `update_sla_status`
    pub fn rank(&self) -> i32 {
        match self {
            SlaStatus::OnTrack => 0,
            SlaStatus::AtRisk => 1,
            SlaStatus::Overdue => 2,
        }
    }

    /// Whether the escalation engine still has work to do for this row
    pub fn is_open(&self) -> bool {
        !matches!(self, SlaStatus::Overdue)
    }
}

impl fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SlaStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_track" => Ok(SlaStatus::OnTrack),
            "at_risk" => Ok(SlaStatus::AtRisk),
            "overdue" => Ok(SlaStatus::Overdue),
            other => Err(ParseEnumError::new("sla status", other)),
        }
    }
}

/// Kind of in-app notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    SlaWarning,
    TaskAssigned,
    ProjectUpdate,
    TicketCreated,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::SlaWarning => "sla_warning",
            NotificationType::TaskAssigned => "task_assigned",
            NotificationType::ProjectUpdate => "project_update",
            NotificationType::TicketCreated => "ticket_created",
        }
    }

    /// Types that may exist at most once per `(related_id, type, user_id)`.
    ///
    /// Backed by a partial unique index, so inserting a duplicate is a no-op.
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, NotificationType::SlaWarning)
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sla_warning" => Ok(NotificationType::SlaWarning),
            "task_assigned" => Ok(NotificationType::TaskAssigned),
            "project_update" => Ok(NotificationType::ProjectUpdate),
            "ticket_created" => Ok(NotificationType::TicketCreated),
            other => Err(ParseEnumError::new("notification type", other)),
        }
    }
}

/// The entity whose deadline an SLA row tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SubjectRef {
    Task(Uuid),
    Ticket(Uuid),
    Project(Uuid),
}

impl SubjectRef {
    pub fn kind(&self) -> &'static str {
        match self {
            SubjectRef::Task(_) => "task",
            SubjectRef::Ticket(_) => "ticket",
            SubjectRef::Project(_) => "project",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            SubjectRef::Task(id) | SubjectRef::Ticket(id) | SubjectRef::Project(id) => *id,
        }
    }

    /// Rebuild a reference from its persisted `(subject_type, subject_id)` columns
    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self, ParseEnumError> {
        match kind {
            "task" => Ok(SubjectRef::Task(id)),
            "ticket" => Ok(SubjectRef::Ticket(id)),
            "project" => Ok(SubjectRef::Project(id)),
            other => Err(ParseEnumError::new("sla subject", other)),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_round_trips_through_text() {
        for plan in [
            SubscriptionPlan::Basic,
            SubscriptionPlan::Professional,
            SubscriptionPlan::Enterprise,
        ] {
            assert_eq!(plan.as_str().parse::<SubscriptionPlan>().unwrap(), plan);
        }
        assert!("gold".parse::<SubscriptionPlan>().is_err());
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete"),
            Some(SubscriptionStatus::Incomplete)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("trialing"),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("unpaid"),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete_expired"),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(SubscriptionStatus::from_provider("mystery"), None);
    }

    #[test]
    fn test_sla_status_ordering() {
        assert!(SlaStatus::OnTrack < SlaStatus::AtRisk);
        assert!(SlaStatus::AtRisk < SlaStatus::Overdue);
        assert!(SlaStatus::AtRisk.is_open());
        assert!(!SlaStatus::Overdue.is_open());
    }

    #[test]
    fn test_only_sla_warnings_are_deduplicated() {
        assert!(NotificationType::SlaWarning.is_deduplicated());
        assert!(!NotificationType::TaskAssigned.is_deduplicated());
        assert!(!NotificationType::ProjectUpdate.is_deduplicated());
        assert!(!NotificationType::TicketCreated.is_deduplicated());
    }

    #[test]
    fn test_subject_ref_parts() {
        let id = Uuid::new_v4();
        let subject = SubjectRef::from_parts("ticket", id).unwrap();
        assert_eq!(subject, SubjectRef::Ticket(id));
        assert_eq!(subject.kind(), "ticket");
        assert_eq!(subject.id(), id);
        assert!(SubjectRef::from_parts("deliverable", id).is_err());
    }

    #[test]
    fn test_subject_ref_serialization() {
        let id = Uuid::nil();
        let json = serde_json::to_value(SubjectRef::Project(id)).unwrap();
        assert_eq!(json["type"], "project");
        assert_eq!(json["id"], id.to_string());
    }
}
