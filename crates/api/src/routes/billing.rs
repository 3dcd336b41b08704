//! Direct billing operations
//!
//! One endpoint takes `{"action": ..., "organizationId": ..., ...}` and
//! dispatches on the action. Unknown actions and malformed bodies are
//! rejected with 400 before any handler runs.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use consultdesk_shared::Organization;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum BillingRequest {
    CreateCustomer {
        organization_id: Uuid,
        email: String,
        name: String,
    },
    CreateSubscription {
        organization_id: Uuid,
        price_id: String,
        #[serde(default)]
        payment_method_id: Option<String>,
    },
    CreatePaymentIntent {
        organization_id: Uuid,
        amount: i64,
        currency: String,
    },
    CancelSubscription {
        organization_id: Uuid,
        subscription_id: String,
    },
    UpdateSubscription {
        organization_id: Uuid,
        subscription_id: String,
        new_price_id: String,
    },
    GetSubscriptionStatus {
        organization_id: Uuid,
    },
}

impl BillingRequest {
    fn organization_id(&self) -> Uuid {
        match self {
            BillingRequest::CreateCustomer {
                organization_id, ..
            }
            | BillingRequest::CreateSubscription {
                organization_id, ..
            }
            | BillingRequest::CreatePaymentIntent {
                organization_id, ..
            }
            | BillingRequest::CancelSubscription {
                organization_id, ..
            }
            | BillingRequest::UpdateSubscription {
                organization_id, ..
            }
            | BillingRequest::GetSubscriptionStatus { organization_id } => *organization_id,
        }
    }
}

fn billing_state(org: &Organization) -> Value {
    json!({
        "organizationId": org.id,
        "plan": org.subscription_plan,
        "status": org.subscription_status,
    })
}

/// POST /billing
pub async fn billing_operation(
    State(state): State<AppState>,
    payload: Result<Json<BillingRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::Validation(format!("Invalid billing request: {}", rejection.body_text()))
    })?;
    let billing = state.billing()?;
    let subscriptions = &billing.subscriptions;

    tracing::debug!(
        org_id = %request.organization_id(),
        request = ?request,
        "Billing operation"
    );

    let response = match request {
        BillingRequest::CreateCustomer {
            organization_id,
            email,
            name,
        } => {
            let customer_id = subscriptions
                .create_customer(organization_id, &email, &name)
                .await?;
            json!({ "success": true, "customerId": customer_id })
        }
        BillingRequest::CreateSubscription {
            organization_id,
            price_id,
            payment_method_id,
        } => {
            let handle = subscriptions
                .create_subscription(organization_id, &price_id, payment_method_id.as_deref())
                .await?;
            json!({
                "success": true,
                "subscriptionId": handle.subscription_id,
                "status": handle.status,
                "plan": handle.plan,
                "clientSecret": handle.client_secret,
            })
        }
        BillingRequest::CreatePaymentIntent {
            organization_id,
            amount,
            currency,
        } => {
            let intent = subscriptions
                .create_payment_intent(organization_id, amount, &currency)
                .await?;
            json!({
                "success": true,
                "paymentIntentId": intent.id,
                "clientSecret": intent.client_secret,
                "status": intent.status,
            })
        }
        BillingRequest::CancelSubscription {
            organization_id,
            subscription_id,
        } => {
            let org = subscriptions
                .cancel_subscription(organization_id, &subscription_id)
                .await?;
            json!({ "success": true, "organization": billing_state(&org) })
        }
        BillingRequest::UpdateSubscription {
            organization_id,
            subscription_id,
            new_price_id,
        } => {
            let org = subscriptions
                .update_subscription(organization_id, &subscription_id, &new_price_id)
                .await?;
            json!({ "success": true, "organization": billing_state(&org) })
        }
        BillingRequest::GetSubscriptionStatus { organization_id } => {
            let view = subscriptions.get_subscription_status(organization_id).await?;
            json!({ "success": true, "subscription": view })
        }
    };

    Ok(Json(response))
}
