//! SLA scheduling and the scan trigger

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use consultdesk_shared::{NewSlaTracking, SubjectRef};
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSlaRequest {
    /// `task`, `ticket` or `project`
    pub subject_type: String,
    pub subject_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub target_date: OffsetDateTime,
    pub warning_threshold_hours: i32,
    #[serde(default)]
    pub assigned_user_id: Option<Uuid>,
}

/// POST /sla
pub async fn schedule_sla(
    State(state): State<AppState>,
    payload: Result<Json<ScheduleSlaRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::Validation(format!("Invalid SLA request: {}", rejection.body_text()))
    })?;

    let subject = SubjectRef::from_parts(&request.subject_type, request.subject_id)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let row = state
        .escalation()?
        .schedule_sla(&NewSlaTracking {
            subject,
            target_date: request.target_date,
            warning_threshold_hours: request.warning_threshold_hours,
            assigned_user_id: request.assigned_user_id,
        })
        .await?;

    Ok(Json(json!({ "success": true, "sla": row })))
}

/// POST /sla/scan
///
/// Called by an external scheduler; takes no input.
pub async fn run_scan(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let result = state.escalation()?.scan_and_escalate().await?;
    Ok(Json(json!({ "success": true, "scan": result })))
}
