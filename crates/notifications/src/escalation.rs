//! SLA escalation
//!
//! A scan walks every open SLA row and moves it along
//! `on_track -> at_risk -> overdue` based on the current time. Nothing is kept
//! in memory between scans: the row status and the existence of an
//! `sla_warning` notification are the whole state, so a scan can be re-run or
//! run concurrently without sending a second warning. A warning whose email
//! failed is sent again by a later scan.

use std::sync::Arc;

use consultdesk_shared::{LedgerError, LedgerStore, NewSlaTracking, SlaStatus, SlaTracking};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{NotificationError, NotificationResult};
use crate::service::NotificationService;

/// Counts from one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Open rows examined
    pub checked: usize,
    /// Warning emails attempted, first sends and retries
    pub warned: usize,
    /// Rows moved to overdue
    pub overdue: usize,
    /// Rows that failed, including failed warning emails
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Unchanged,
    AtRisk,
    Warned { email_sent: bool },
    Overdue,
}

#[derive(Clone)]
pub struct SlaEscalationEngine {
    ledger: Arc<dyn LedgerStore>,
    notifications: NotificationService,
}

impl SlaEscalationEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, notifications: NotificationService) -> Self {
        Self {
            ledger,
            notifications,
        }
    }

    /// Start tracking a deadline
    pub async fn schedule_sla(&self, new: &NewSlaTracking) -> NotificationResult<SlaTracking> {
        if new.warning_threshold_hours <= 0 {
            return Err(NotificationError::Validation(
                "warningThresholdHours must be positive".to_string(),
            ));
        }

        let row = self.ledger.insert_sla_tracking(new).await?;
        tracing::info!(
            sla_id = %row.id,
            subject = %row.subject,
            target_date = %row.target_date,
            "Scheduled SLA tracking"
        );
        Ok(row)
    }

    pub async fn scan_and_escalate(&self) -> NotificationResult<ScanResult> {
        self.scan_at(OffsetDateTime::now_utc()).await
    }

    /// Run one scan as of `now`
    ///
    /// Only a failure to list the rows fails the scan; each row is handled
    /// on its own and its failure is counted and logged.
    pub async fn scan_at(&self, now: OffsetDateTime) -> NotificationResult<ScanResult> {
        let rows = self.ledger.list_open_sla_trackings().await?;
        let mut result = ScanResult::default();

        for row in &rows {
            result.checked += 1;
            match self.escalate_row(row, now).await {
                Ok(RowOutcome::Overdue) => result.overdue += 1,
                Ok(RowOutcome::Warned { email_sent }) => {
                    result.warned += 1;
                    if !email_sent {
                        result.errors += 1;
                    }
                }
                Ok(RowOutcome::AtRisk | RowOutcome::Unchanged) => {}
                Err(e) => {
                    result.errors += 1;
                    tracing::error!(
                        sla_id = %row.id,
                        subject = %row.subject,
                        error = %e,
                        "Failed to escalate SLA row"
                    );
                }
            }
        }

        tracing::info!(
            checked = result.checked,
            warned = result.warned,
            overdue = result.overdue,
            errors = result.errors,
            "SLA scan complete"
        );

        Ok(result)
    }

    async fn escalate_row(
        &self,
        row: &SlaTracking,
        now: OffsetDateTime,
    ) -> NotificationResult<RowOutcome> {
        let hours_until_due = row.hours_until_due(now);

        if hours_until_due <= 0.0 {
            if !self.advance(row, SlaStatus::Overdue).await? {
                return Ok(RowOutcome::Unchanged);
            }
            tracing::warn!(
                sla_id = %row.id,
                subject = %row.subject,
                target_date = %row.target_date,
                "SLA row is overdue"
            );
            return Ok(RowOutcome::Overdue);
        }

        if hours_until_due > f64::from(row.warning_threshold_hours) {
            return Ok(RowOutcome::Unchanged);
        }

        // Status first, so a sent warning never sits on an on_track row
        if row.status == SlaStatus::OnTrack {
            self.advance(row, SlaStatus::AtRisk).await?;
        }

        let Some(user_id) = row.assigned_user_id else {
            tracing::debug!(sla_id = %row.id, "SLA row at risk with no assignee to warn");
            return Ok(RowOutcome::AtRisk);
        };

        match self
            .notifications
            .send_sla_warning(row, user_id, now)
            .await?
        {
            Some(delivery) => {
                tracing::info!(
                    sla_id = %row.id,
                    user_id = %user_id,
                    hours_until_due = hours_until_due,
                    email_sent = delivery.email_sent,
                    "SLA warning issued"
                );
                Ok(RowOutcome::Warned {
                    email_sent: delivery.email_sent,
                })
            }
            None => Ok(RowOutcome::AtRisk),
        }
    }

    /// Move a row forward to `target`. Returns whether this call moved it.
    ///
    /// On a version conflict the row is re-read once; if someone else has
    /// already moved it at least as far, there is nothing left to do.
    async fn advance(&self, row: &SlaTracking, target: SlaStatus) -> NotificationResult<bool> {
        match self
            .ledger
            .update_sla_status(row.id, row.version, target)
            .await
        {
            Ok(_) => Ok(true),
            Err(LedgerError::ConcurrencyConflict { .. }) => {
                let current = self.ledger.get_sla_tracking(row.id).await?.ok_or_else(|| {
                    NotificationError::NotFound(format!("SLA row {} not found", row.id))
                })?;
                if current.status >= target {
                    return Ok(false);
                }
                self.ledger
                    .update_sla_status(current.id, current.version, target)
                    .await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}
