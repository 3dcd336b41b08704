//! PostgreSQL ledger store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingUpdate, LedgerError, LedgerResult, LedgerStore, NewNotification, NewSlaTracking,
    Notification, Organization, SlaTracking, UserContact, WebhookEventClaim, WebhookEventRecord,
    WebhookProcessingResult,
};
use crate::types::{NotificationType, SlaStatus, SubjectRef};

const ORGANIZATION_COLUMNS: &str = r#"
    id, name, external_customer_id, subscription_plan, subscription_status,
    last_event_at, version, created_at, updated_at
"#;

const SLA_COLUMNS: &str = r#"
    id, subject_type, subject_id, target_date, warning_threshold_hours,
    status, assigned_user_id, version, created_at, updated_at
"#;

const NOTIFICATION_COLUMNS: &str = r#"
    id, user_id, title, message, notification_type, related_id, is_email_sent,
    email_attempted_at, created_at
"#;

const WEBHOOK_EVENT_COLUMNS: &str = r#"
    event_id, event_type, event_timestamp, payload, processing_result,
    error_message, processing_started_at, created_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    external_customer_id: Option<String>,
    subscription_plan: String,
    subscription_status: String,
    last_event_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = LedgerError;

    fn try_from(row: OrganizationRow) -> Result<Self, Self::Error> {
        Ok(Organization {
            id: row.id,
            name: row.name,
            external_customer_id: row.external_customer_id,
            subscription_plan: row.subscription_plan.parse()?,
            subscription_status: row.subscription_status.parse()?,
            last_event_at: row.last_event_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SlaRow {
    id: Uuid,
    subject_type: String,
    subject_id: Uuid,
    target_date: OffsetDateTime,
    warning_threshold_hours: i32,
    status: String,
    assigned_user_id: Option<Uuid>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SlaRow> for SlaTracking {
    type Error = LedgerError;

    fn try_from(row: SlaRow) -> Result<Self, Self::Error> {
        Ok(SlaTracking {
            id: row.id,
            subject: SubjectRef::from_parts(&row.subject_type, row.subject_id)?,
            target_date: row.target_date,
            warning_threshold_hours: row.warning_threshold_hours,
            status: row.status.parse()?,
            assigned_user_id: row.assigned_user_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    message: String,
    notification_type: String,
    related_id: Uuid,
    is_email_sent: bool,
    email_attempted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = LedgerError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            message: row.message,
            notification_type: row.notification_type.parse()?,
            related_id: row.related_id,
            is_email_sent: row.is_email_sent,
            email_attempted_at: row.email_attempted_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    event_id: String,
    event_type: String,
    event_timestamp: OffsetDateTime,
    payload: String,
    processing_result: String,
    error_message: Option<String>,
    processing_started_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = LedgerError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            event_timestamp: row.event_timestamp,
            payload: row.payload,
            processing_result: row.processing_result.parse()?,
            error_message: row.error_message,
            processing_started_at: row.processing_started_at,
            created_at: row.created_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> LedgerResult<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Ledger store backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded UPDATE matched no row
    async fn sla_update_failure(
        &self,
        id: Uuid,
        expected_version: i64,
        status: SlaStatus,
    ) -> LedgerError {
        let current = match self.get_sla_tracking(id).await {
            Ok(current) => current,
            Err(e) => return e,
        };
        match current {
            None => LedgerError::not_found("sla_tracking", id),
            Some(row) if row.version != expected_version => {
                LedgerError::conflict("sla_tracking", id)
            }
            Some(row) => LedgerError::Constraint(format!(
                "sla status cannot move from {} back to {}",
                row.status, status
            )),
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_organization(&self, name: &str) -> LedgerResult<Organization> {
        let row: OrganizationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO organizations (id, name)
            VALUES ($1, $2)
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_organization(&self, org_id: Uuid) -> LedgerResult<Option<Organization>> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Organization::try_from).transpose()
    }

    async fn find_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> LedgerResult<Option<Organization>> {
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE external_customer_id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Organization::try_from).transpose()
    }

    async fn list_organizations(&self) -> LedgerResult<Vec<Organization>> {
        let rows: Vec<OrganizationRow> = sqlx::query_as(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn update_organization_billing(
        &self,
        org_id: Uuid,
        expected_version: i64,
        update: &BillingUpdate,
    ) -> LedgerResult<Organization> {
        update.check_invariant()?;

        // Single statement: the version guard and all billing fields change together
        let row: Option<OrganizationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE organizations
            SET external_customer_id = $3,
                subscription_plan = $4,
                subscription_status = $5,
                last_event_at = $6,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(org_id)
        .bind(expected_version)
        .bind(&update.external_customer_id)
        .bind(update.subscription_plan.as_str())
        .bind(update.subscription_status.as_str())
        .bind(update.last_event_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let exists: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM organizations WHERE id = $1")
                        .bind(org_id)
                        .fetch_optional(&self.pool)
                        .await?;
                Err(match exists {
                    Some(_) => LedgerError::conflict("organization", org_id),
                    None => LedgerError::not_found("organization", org_id),
                })
            }
        }
    }

    async fn get_user_contact(&self, user_id: Uuid) -> LedgerResult<Option<UserContact>> {
        let row: Option<(Uuid, String, Option<String>)> =
            sqlx::query_as("SELECT id, email, full_name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, email, full_name)| UserContact {
            id,
            email,
            full_name,
        }))
    }

    async fn insert_sla_tracking(&self, new: &NewSlaTracking) -> LedgerResult<SlaTracking> {
        let row: SlaRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO sla_tracking
                (id, subject_type, subject_id, target_date, warning_threshold_hours, assigned_user_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SLA_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.subject.kind())
        .bind(new.subject.id())
        .bind(new.target_date)
        .bind(new.warning_threshold_hours)
        .bind(new.assigned_user_id)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_sla_tracking(&self, id: Uuid) -> LedgerResult<Option<SlaTracking>> {
        let row: Option<SlaRow> =
            sqlx::query_as(&format!("SELECT {SLA_COLUMNS} FROM sla_tracking WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(SlaTracking::try_from).transpose()
    }

    async fn list_open_sla_trackings(&self) -> LedgerResult<Vec<SlaTracking>> {
        let rows: Vec<SlaRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SLA_COLUMNS}
            FROM sla_tracking
            WHERE status IN ('on_track', 'at_risk')
            ORDER BY target_date
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn update_sla_status(
        &self,
        id: Uuid,
        expected_version: i64,
        status: SlaStatus,
    ) -> LedgerResult<SlaTracking> {
        let row: Option<SlaRow> = sqlx::query_as(&format!(
            r#"
            UPDATE sla_tracking
            SET status = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1
              AND version = $2
              AND (CASE status WHEN 'on_track' THEN 0 WHEN 'at_risk' THEN 1 ELSE 2 END) <= $4
            RETURNING {SLA_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected_version)
        .bind(status.as_str())
        .bind(status.rank())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.sla_update_failure(id, expected_version, status).await),
        }
    }

    async fn insert_notification(
        &self,
        new: &NewNotification,
    ) -> LedgerResult<Option<Notification>> {
        // The partial unique index only covers deduplicated types, so the
        // conflict target never matches for the others
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO notifications
                (id, user_id, title, message, notification_type, related_id, email_attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (related_id, notification_type, user_id)
                WHERE notification_type = 'sla_warning'
                DO NOTHING
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.title)
        .bind(&new.message)
        .bind(new.notification_type.as_str())
        .bind(new.related_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Notification::try_from).transpose()
    }

    async fn claim_notification_resend(
        &self,
        related_id: Uuid,
        notification_type: NotificationType,
        user_id: Uuid,
        attempted_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> LedgerResult<Option<Notification>> {
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE notifications
            SET email_attempted_at = $5
            WHERE related_id = $1
              AND notification_type = $2
              AND user_id = $3
              AND is_email_sent = FALSE
              AND (email_attempted_at IS NULL OR email_attempted_at < $4)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(related_id)
        .bind(notification_type.as_str())
        .bind(user_id)
        .bind(attempted_before)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Notification::try_from).transpose()
    }

    async fn mark_notification_email_sent(&self, id: Uuid) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE notifications SET is_email_sent = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("notification", id));
        }
        Ok(())
    }

    async fn list_notifications_for_related(
        &self,
        related_id: Uuid,
        notification_type: NotificationType,
    ) -> LedgerResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE related_id = $1 AND notification_type = $2
            ORDER BY created_at
            "#
        ))
        .bind(related_id)
        .bind(notification_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn list_notifications_by_type(
        &self,
        notification_type: NotificationType,
    ) -> LedgerResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE notification_type = $1
            ORDER BY created_at
            "#
        ))
        .bind(notification_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn claim_webhook_event(&self, claim: &WebhookEventClaim) -> LedgerResult<bool> {
        // INSERT...ON CONFLICT...RETURNING hands exclusive processing rights to
        // exactly one caller. A claim stuck in 'processing' past the timeout can
        // be taken over.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events
                (event_id, event_type, event_timestamp, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE processed_webhook_events.processing_result = 'processing'
              AND processed_webhook_events.processing_started_at < NOW() - make_interval(secs => $5)
            RETURNING event_id
            "#,
        )
        .bind(&claim.event_id)
        .bind(&claim.event_type)
        .bind(claim.event_timestamp)
        .bind(&claim.payload)
        .bind(claim.stale_after.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn get_webhook_event(&self, event_id: &str) -> LedgerResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_EVENT_COLUMNS} FROM processed_webhook_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookProcessingResult,
        error_message: Option<&str>,
    ) -> LedgerResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(LedgerError::not_found("webhook_event", event_id));
        }
        Ok(())
    }

    async fn list_failed_webhook_events(
        &self,
        limit: i64,
    ) -> LedgerResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_EVENT_COLUMNS}
            FROM processed_webhook_events
            WHERE processing_result = 'error'
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn purge_webhook_events(&self, older_than: OffsetDateTime) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
