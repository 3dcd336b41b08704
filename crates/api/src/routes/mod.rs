//! HTTP routes

pub mod billing;
pub mod notifications;
pub mod sla;
pub mod webhooks;


use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .route("/billing", post(billing::billing_operation))
        .route("/notifications", post(notifications::send_notification))
        .route("/sla", post(sla::schedule_sla))
        .route("/sla/scan", post(sla::run_scan))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
