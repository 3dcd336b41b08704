//! In-memory ledger store
//!
//! Mirrors the PostgreSQL constraints (version checks, the customer id
//! invariant, the SLA warning unique key, monotonic SLA status) so that code
//! exercised against it behaves the same in production. All state sits behind
//! a single lock, which makes every trait method atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BillingUpdate, LedgerError, LedgerResult, LedgerStore, NewNotification, NewSlaTracking,
    Notification, Organization, SlaTracking, UserContact, WebhookEventClaim, WebhookEventRecord,
    WebhookProcessingResult,
};
use crate::types::{NotificationType, SlaStatus, SubscriptionPlan, SubscriptionStatus};

#[derive(Default)]
struct Inner {
    organizations: HashMap<Uuid, Organization>,
    users: HashMap<Uuid, UserContact>,
    sla_trackings: HashMap<Uuid, SlaTracking>,
    notifications: Vec<Notification>,
    webhook_events: HashMap<String, WebhookEventRecord>,
}

/// Ledger store backed by process memory
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user so notifications can be addressed to them
    pub async fn insert_user(&self, email: &str, full_name: Option<&str>) -> UserContact {
        let contact = UserContact {
            id: Uuid::new_v4(),
            email: email.to_string(),
            full_name: full_name.map(str::to_string),
        };
        self.inner
            .write()
            .await
            .users
            .insert(contact.id, contact.clone());
        contact
    }

    /// Backdate a webhook event record (retention tests)
    pub async fn set_webhook_event_created_at(&self, event_id: &str, created_at: OffsetDateTime) {
        if let Some(record) = self.inner.write().await.webhook_events.get_mut(event_id) {
            record.created_at = created_at;
            record.processing_started_at = created_at;
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_organization(&self, name: &str) -> LedgerResult<Organization> {
        let now = OffsetDateTime::now_utc();
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            external_customer_id: None,
            subscription_plan: SubscriptionPlan::Basic,
            subscription_status: SubscriptionStatus::None,
            last_event_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .write()
            .await
            .organizations
            .insert(org.id, org.clone());
        Ok(org)
    }

    async fn get_organization(&self, org_id: Uuid) -> LedgerResult<Option<Organization>> {
        Ok(self.inner.read().await.organizations.get(&org_id).cloned())
    }

    async fn find_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> LedgerResult<Option<Organization>> {
        Ok(self
            .inner
            .read()
            .await
            .organizations
            .values()
            .find(|org| org.external_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn list_organizations(&self) -> LedgerResult<Vec<Organization>> {
        let mut orgs: Vec<Organization> = self
            .inner
            .read()
            .await
            .organizations
            .values()
            .cloned()
            .collect();
        orgs.sort_by_key(|org| org.created_at);
        Ok(orgs)
    }

    async fn update_organization_billing(
        &self,
        org_id: Uuid,
        expected_version: i64,
        update: &BillingUpdate,
    ) -> LedgerResult<Organization> {
        update.check_invariant()?;

        let mut inner = self.inner.write().await;

        if let Some(customer_id) = &update.external_customer_id {
            let taken = inner.organizations.values().any(|other| {
                other.id != org_id && other.external_customer_id.as_ref() == Some(customer_id)
            });
            if taken {
                return Err(LedgerError::Constraint(format!(
                    "external customer id {} already linked to another organization",
                    customer_id
                )));
            }
        }

        let org = inner
            .organizations
            .get_mut(&org_id)
            .ok_or_else(|| LedgerError::not_found("organization", org_id))?;

        if org.version != expected_version {
            return Err(LedgerError::conflict("organization", org_id));
        }

        org.external_customer_id = update.external_customer_id.clone();
        org.subscription_plan = update.subscription_plan;
        org.subscription_status = update.subscription_status;
        org.last_event_at = update.last_event_at;
        org.version += 1;
        org.updated_at = OffsetDateTime::now_utc();

        Ok(org.clone())
    }

    async fn get_user_contact(&self, user_id: Uuid) -> LedgerResult<Option<UserContact>> {
        Ok(self.inner.read().await.users.get(&user_id).cloned())
    }

    async fn insert_sla_tracking(&self, new: &NewSlaTracking) -> LedgerResult<SlaTracking> {
        if new.warning_threshold_hours <= 0 {
            return Err(LedgerError::Constraint(
                "warning_threshold_hours must be positive".to_string(),
            ));
        }
        let now = OffsetDateTime::now_utc();
        let row = SlaTracking {
            id: Uuid::new_v4(),
            subject: new.subject,
            target_date: new.target_date,
            warning_threshold_hours: new.warning_threshold_hours,
            status: SlaStatus::OnTrack,
            assigned_user_id: new.assigned_user_id,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .write()
            .await
            .sla_trackings
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_sla_tracking(&self, id: Uuid) -> LedgerResult<Option<SlaTracking>> {
        Ok(self.inner.read().await.sla_trackings.get(&id).cloned())
    }

    async fn list_open_sla_trackings(&self) -> LedgerResult<Vec<SlaTracking>> {
        let mut rows: Vec<SlaTracking> = self
            .inner
            .read()
            .await
            .sla_trackings
            .values()
            .filter(|row| row.status.is_open())
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.target_date);
        Ok(rows)
    }

    async fn update_sla_status(
        &self,
        id: Uuid,
        expected_version: i64,
        status: SlaStatus,
    ) -> LedgerResult<SlaTracking> {
        let mut inner = self.inner.write().await;
        let row = inner
            .sla_trackings
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("sla_tracking", id))?;

        if row.version != expected_version {
            return Err(LedgerError::conflict("sla_tracking", id));
        }
        if status < row.status {
            return Err(LedgerError::Constraint(format!(
                "sla status cannot move from {} back to {}",
                row.status, status
            )));
        }

        row.status = status;
        row.version += 1;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(row.clone())
    }

    async fn insert_notification(
        &self,
        new: &NewNotification,
    ) -> LedgerResult<Option<Notification>> {
        let mut inner = self.inner.write().await;

        if new.notification_type.is_deduplicated() {
            let exists = inner.notifications.iter().any(|n| {
                n.related_id == new.related_id
                    && n.notification_type == new.notification_type
                    && n.user_id == new.user_id
            });
            if exists {
                return Ok(None);
            }
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            title: new.title.clone(),
            message: new.message.clone(),
            notification_type: new.notification_type,
            related_id: new.related_id,
            is_email_sent: false,
            email_attempted_at: Some(OffsetDateTime::now_utc()),
            created_at: OffsetDateTime::now_utc(),
        };
        inner.notifications.push(notification.clone());
        Ok(Some(notification))
    }

    async fn claim_notification_resend(
        &self,
        related_id: Uuid,
        notification_type: NotificationType,
        user_id: Uuid,
        attempted_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> LedgerResult<Option<Notification>> {
        let mut inner = self.inner.write().await;
        let claimable = inner.notifications.iter_mut().find(|n| {
            n.related_id == related_id
                && n.notification_type == notification_type
                && n.user_id == user_id
                && !n.is_email_sent
                && n.email_attempted_at.map_or(true, |at| at < attempted_before)
        });

        Ok(claimable.map(|n| {
            n.email_attempted_at = Some(now);
            n.clone()
        }))
    }

    async fn mark_notification_email_sent(&self, id: Uuid) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        let notification = inner
            .notifications
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| LedgerError::not_found("notification", id))?;
        notification.is_email_sent = true;
        Ok(())
    }

    async fn list_notifications_for_related(
        &self,
        related_id: Uuid,
        notification_type: NotificationType,
    ) -> LedgerResult<Vec<Notification>> {
        Ok(self
            .inner
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.related_id == related_id && n.notification_type == notification_type)
            .cloned()
            .collect())
    }

    async fn list_notifications_by_type(
        &self,
        notification_type: NotificationType,
    ) -> LedgerResult<Vec<Notification>> {
        Ok(self
            .inner
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.notification_type == notification_type)
            .cloned()
            .collect())
    }

    async fn claim_webhook_event(&self, claim: &WebhookEventClaim) -> LedgerResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;

        match inner.webhook_events.get_mut(&claim.event_id) {
            Some(existing) => {
                let stale = existing.processing_result == WebhookProcessingResult::Processing
                    && existing.processing_started_at < now - claim.stale_after;
                if !stale {
                    return Ok(false);
                }
                existing.processing_started_at = now;
                existing.error_message = Some(format!("Recovered from stuck state at {}", now));
                Ok(true)
            }
            None => {
                inner.webhook_events.insert(
                    claim.event_id.clone(),
                    WebhookEventRecord {
                        event_id: claim.event_id.clone(),
                        event_type: claim.event_type.clone(),
                        event_timestamp: claim.event_timestamp,
                        payload: claim.payload.clone(),
                        processing_result: WebhookProcessingResult::Processing,
                        error_message: None,
                        processing_started_at: now,
                        created_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn get_webhook_event(&self, event_id: &str) -> LedgerResult<Option<WebhookEventRecord>> {
        Ok(self.inner.read().await.webhook_events.get(event_id).cloned())
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookProcessingResult,
        error_message: Option<&str>,
    ) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| LedgerError::not_found("webhook_event", event_id))?;
        record.processing_result = result;
        record.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn list_failed_webhook_events(
        &self,
        limit: i64,
    ) -> LedgerResult<Vec<WebhookEventRecord>> {
        let mut failed: Vec<WebhookEventRecord> = self
            .inner
            .read()
            .await
            .webhook_events
            .values()
            .filter(|r| r.processing_result == WebhookProcessingResult::Error)
            .cloned()
            .collect();
        failed.sort_by_key(|r| r.created_at);
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed)
    }

    async fn purge_webhook_events(&self, older_than: OffsetDateTime) -> LedgerResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.webhook_events.len();
        inner
            .webhook_events
            .retain(|_, record| record.created_at >= older_than);
        Ok((before - inner.webhook_events.len()) as u64)
    }
}
