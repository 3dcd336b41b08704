//! Notification triggers
//!
//! Each trigger records a notification row for the recipient and then tries
//! to email it. The row is written first; a failed send leaves it with
//! `is_email_sent = false` and is reported in the returned delivery.

use std::sync::Arc;

use consultdesk_shared::{
    LedgerStore, NewNotification, Notification, NotificationType, SlaTracking, SubjectRef,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::EmailGateway;
use crate::error::{NotificationError, NotificationResult};
use crate::templates::EmailContent;

/// How long an unsent deduplicated email is left alone before another
/// attempt may claim it. Shorter than the SLA scan period, longer than a send.
pub const EMAIL_RETRY_AFTER: time::Duration = time::Duration::minutes(5);

/// A task was assigned to someone
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub task_title: String,
    pub assignee_id: Uuid,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
}

/// Something changed on a project its members follow
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub project_id: Uuid,
    pub project_name: String,
    pub summary: String,
    pub recipient_ids: Vec<Uuid>,
}

/// A ticket was opened
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketNotice {
    pub ticket_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub priority: Option<String>,
    pub recipient_ids: Vec<Uuid>,
}

/// Outcome of one notification
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub notification: Notification,
    pub email_sent: bool,
    pub email_error: Option<String>,
}

/// Creates notification rows and sends their emails
#[derive(Clone)]
pub struct NotificationService {
    ledger: Arc<dyn LedgerStore>,
    email: Arc<dyn EmailGateway>,
    dashboard_url: String,
}

impl NotificationService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        email: Arc<dyn EmailGateway>,
        dashboard_url: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            email,
            dashboard_url: dashboard_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn link(&self, subject: SubjectRef) -> String {
        format!("{}/{}s/{}", self.dashboard_url, subject.kind(), subject.id())
    }

    pub async fn send_task_assignment(
        &self,
        assignment: &TaskAssignment,
    ) -> NotificationResult<Delivery> {
        require_text("taskTitle", &assignment.task_title)?;

        let content = EmailContent::task_assignment(
            &assignment.task_title,
            assignment.project_name.as_deref(),
            assignment.due_date,
            &self.link(SubjectRef::Task(assignment.task_id)),
        );

        let delivery = self
            .deliver(
                assignment.assignee_id,
                NewNotification {
                    user_id: assignment.assignee_id,
                    title: "New task assigned".to_string(),
                    message: format!("You have been assigned: {}", assignment.task_title),
                    notification_type: NotificationType::TaskAssigned,
                    related_id: assignment.task_id,
                },
                content,
                OffsetDateTime::now_utc(),
            )
            .await?;

        // Only sla_warning rows are de-duplicated by the ledger
        delivery.ok_or_else(|| {
            NotificationError::Database("Task assignment notification was not recorded".into())
        })
    }

    pub async fn send_project_update(
        &self,
        update: &ProjectUpdate,
    ) -> NotificationResult<Vec<Delivery>> {
        require_text("projectName", &update.project_name)?;
        require_text("summary", &update.summary)?;
        require_recipients(&update.recipient_ids)?;

        let content = EmailContent::project_update(
            &update.project_name,
            &update.summary,
            &self.link(SubjectRef::Project(update.project_id)),
        );

        self.fan_out(&update.recipient_ids, content, |user_id| NewNotification {
            user_id,
            title: format!("Project update: {}", update.project_name),
            message: update.summary.clone(),
            notification_type: NotificationType::ProjectUpdate,
            related_id: update.project_id,
        })
        .await
    }

    pub async fn send_ticket_notification(
        &self,
        notice: &TicketNotice,
    ) -> NotificationResult<Vec<Delivery>> {
        require_text("title", &notice.title)?;
        require_recipients(&notice.recipient_ids)?;

        let content = EmailContent::ticket_created(
            &notice.title,
            notice.priority.as_deref(),
            &self.link(SubjectRef::Ticket(notice.ticket_id)),
        );

        self.fan_out(&notice.recipient_ids, content, |user_id| NewNotification {
            user_id,
            title: format!("New ticket: {}", notice.title),
            message: notice
                .priority
                .as_ref()
                .map(|p| format!("Priority: {}", p))
                .unwrap_or_else(|| "A new ticket was created".to_string()),
            notification_type: NotificationType::TicketCreated,
            related_id: notice.ticket_id,
        })
        .await
    }

    /// Record and send the warning for an SLA row approaching its deadline
    ///
    /// Returns `None` when the warning for this row and user was already
    /// emailed, or another attempt at it started less than
    /// [`EMAIL_RETRY_AFTER`] ago. An earlier warning whose email failed is
    /// sent again.
    pub async fn send_sla_warning(
        &self,
        row: &SlaTracking,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> NotificationResult<Option<Delivery>> {
        let hours_left = row.hours_until_due(now);
        let content = EmailContent::sla_warning(
            row.subject,
            row.target_date,
            hours_left,
            &self.link(row.subject),
        );

        self.deliver(
            user_id,
            NewNotification {
                user_id,
                title: format!("SLA warning: {} due soon", row.subject.kind()),
                message: format!(
                    "{} {} is due in {:.1} hours",
                    row.subject.kind(),
                    row.subject.id(),
                    hours_left
                ),
                notification_type: NotificationType::SlaWarning,
                related_id: row.id,
            },
            content,
            now,
        )
        .await
    }

    /// Deliver to every recipient; one recipient failing does not stop the rest
    async fn fan_out<F>(
        &self,
        recipients: &[Uuid],
        content: EmailContent,
        build: F,
    ) -> NotificationResult<Vec<Delivery>>
    where
        F: Fn(Uuid) -> NewNotification,
    {
        let mut deliveries = Vec::with_capacity(recipients.len());
        let now = OffsetDateTime::now_utc();

        for &user_id in recipients {
            match self.deliver(user_id, build(user_id), content.clone(), now).await {
                Ok(Some(delivery)) => deliveries.push(delivery),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Skipping notification recipient"
                    );
                }
            }
        }

        Ok(deliveries)
    }

    /// Claim the unsent email of an existing deduplicated notification
    async fn claim_resend(
        &self,
        new: &NewNotification,
        now: OffsetDateTime,
    ) -> NotificationResult<Option<Notification>> {
        if !new.notification_type.is_deduplicated() {
            return Ok(None);
        }

        let claimed = self
            .ledger
            .claim_notification_resend(
                new.related_id,
                new.notification_type,
                new.user_id,
                now - EMAIL_RETRY_AFTER,
                now,
            )
            .await?;

        if let Some(notification) = &claimed {
            tracing::info!(
                notification_id = %notification.id,
                user_id = %new.user_id,
                notification_type = %new.notification_type,
                "Retrying notification email"
            );
        }
        Ok(claimed)
    }

    async fn deliver(
        &self,
        user_id: Uuid,
        new: NewNotification,
        content: EmailContent,
        now: OffsetDateTime,
    ) -> NotificationResult<Option<Delivery>> {
        let contact = self
            .ledger
            .get_user_contact(user_id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(format!("User {} not found", user_id)))?;

        let mut notification = match self.ledger.insert_notification(&new).await? {
            Some(notification) => notification,
            None => match self.claim_resend(&new, now).await? {
                Some(notification) => notification,
                None => {
                    tracing::debug!(
                        user_id = %user_id,
                        related_id = %new.related_id,
                        notification_type = %new.notification_type,
                        "Notification already recorded, not sending again"
                    );
                    return Ok(None);
                }
            },
        };

        match self.email.send(&content.to(&contact.email)).await {
            Ok(_) => {
                match self
                    .ledger
                    .mark_notification_email_sent(notification.id)
                    .await
                {
                    Ok(()) => notification.is_email_sent = true,
                    Err(e) => {
                        tracing::error!(
                            notification_id = %notification.id,
                            error = %e,
                            "Email sent but failed to mark notification as sent"
                        );
                    }
                }

                Ok(Some(Delivery {
                    notification,
                    email_sent: true,
                    email_error: None,
                }))
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    user_id = %user_id,
                    notification_type = %new.notification_type,
                    error = %e,
                    "Failed to send notification email"
                );

                Ok(Some(Delivery {
                    notification,
                    email_sent: false,
                    email_error: Some(e.to_string()),
                }))
            }
        }
    }
}

fn require_text(field: &str, value: &str) -> NotificationResult<()> {
    if value.trim().is_empty() {
        return Err(NotificationError::Validation(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn require_recipients(recipients: &[Uuid]) -> NotificationResult<()> {
    if recipients.is_empty() {
        return Err(NotificationError::Validation(
            "recipientIds must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEmailGateway;
    use consultdesk_shared::InMemoryLedgerStore;

    struct Harness {
        service: NotificationService,
        email: Arc<FakeEmailGateway>,
        ledger: InMemoryLedgerStore,
    }

    fn harness() -> Harness {
        let ledger = InMemoryLedgerStore::new();
        let email = Arc::new(FakeEmailGateway::new());
        Harness {
            service: NotificationService::new(
                Arc::new(ledger.clone()),
                email.clone(),
                "https://app.test/",
            ),
            email,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_task_assignment_records_and_sends() {
        let h = harness();
        let user = h.ledger.insert_user("dev@example.com", Some("Dev")).await;
        let task_id = Uuid::new_v4();

        let delivery = h
            .service
            .send_task_assignment(&TaskAssignment {
                task_id,
                task_title: "Draft proposal".to_string(),
                assignee_id: user.id,
                project_name: Some("Apollo".to_string()),
                due_date: None,
            })
            .await
            .unwrap();

        assert!(delivery.email_sent);
        assert!(delivery.notification.is_email_sent);
        assert_eq!(delivery.notification.related_id, task_id);

        let sent = h.email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "dev@example.com");
        assert!(sent[0].text.contains(&format!("https://app.test/tasks/{}", task_id)));
    }

    #[tokio::test]
    async fn test_failed_send_keeps_unsent_row() {
        let h = harness();
        let user = h.ledger.insert_user("dev@example.com", None).await;
        h.email.fail_next(NotificationError::provider("down", true));

        let delivery = h
            .service
            .send_task_assignment(&TaskAssignment {
                task_id: Uuid::new_v4(),
                task_title: "Draft proposal".to_string(),
                assignee_id: user.id,
                project_name: None,
                due_date: None,
            })
            .await
            .unwrap();

        assert!(!delivery.email_sent);
        assert!(delivery.email_error.is_some());

        let stored = h
            .ledger
            .list_notifications_for_related(
                delivery.notification.related_id,
                NotificationType::TaskAssigned,
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].is_email_sent);
    }

    #[tokio::test]
    async fn test_unknown_assignee_is_not_found() {
        let h = harness();
        let err = h
            .service
            .send_task_assignment(&TaskAssignment {
                task_id: Uuid::new_v4(),
                task_title: "Draft proposal".to_string(),
                assignee_id: Uuid::new_v4(),
                project_name: None,
                due_date: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, NotificationError::NotFound(_)));
        assert!(h.email.sent().is_empty());
    }

    #[tokio::test]
    async fn test_project_update_skips_unknown_recipients() {
        let h = harness();
        let a = h.ledger.insert_user("a@example.com", None).await;
        let b = h.ledger.insert_user("b@example.com", None).await;

        let deliveries = h
            .service
            .send_project_update(&ProjectUpdate {
                project_id: Uuid::new_v4(),
                project_name: "Apollo".to_string(),
                summary: "Phase 2 signed off".to_string(),
                recipient_ids: vec![a.id, Uuid::new_v4(), b.id],
            })
            .await
            .unwrap();

        assert_eq!(deliveries.len(), 2);
        assert_eq!(h.email.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_ticket_notification_validates_input() {
        let h = harness();

        let err = h
            .service
            .send_ticket_notification(&TicketNotice {
                ticket_id: Uuid::new_v4(),
                title: "Login broken".to_string(),
                priority: Some("high".to_string()),
                recipient_ids: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation(_)));

        let err = h
            .service
            .send_ticket_notification(&TicketNotice {
                ticket_id: Uuid::new_v4(),
                title: "  ".to_string(),
                priority: None,
                recipient_ids: vec![Uuid::new_v4()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation(_)));
    }

    #[test]
    fn test_task_assignment_deserializes_camel_case() {
        let assignment: TaskAssignment = serde_json::from_value(serde_json::json!({
            "taskId": Uuid::nil(),
            "taskTitle": "Review",
            "assigneeId": Uuid::nil(),
            "dueDate": "2026-03-14T09:30:00Z",
        }))
        .unwrap();

        assert_eq!(assignment.task_title, "Review");
        assert!(assignment.project_name.is_none());
        assert!(assignment.due_date.is_some());
    }
}
