//! Notification triggers from the dashboard

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use consultdesk_notifications::{ProjectUpdate, TaskAssignment, TicketNotice};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotificationRequest {
    SendTaskAssignment(TaskAssignment),
    SendProjectUpdate(ProjectUpdate),
    SendTicketNotification(TicketNotice),
}

/// POST /notifications
pub async fn send_notification(
    State(state): State<AppState>,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::Validation(format!(
            "Invalid notification request: {}",
            rejection.body_text()
        ))
    })?;
    let notifications = state.notifications()?;

    let response = match request {
        NotificationRequest::SendTaskAssignment(assignment) => {
            let delivery = notifications.send_task_assignment(&assignment).await?;
            json!({ "success": true, "deliveries": [delivery] })
        }
        NotificationRequest::SendProjectUpdate(update) => {
            let deliveries = notifications.send_project_update(&update).await?;
            json!({ "success": true, "deliveries": deliveries })
        }
        NotificationRequest::SendTicketNotification(notice) => {
            let deliveries = notifications.send_ticket_notification(&notice).await?;
            json!({ "success": true, "deliveries": deliveries })
        }
    };

    Ok(Json(response))
}
