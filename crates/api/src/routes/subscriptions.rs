//! Subscription routes
//!
//! Renewal does not require an active subscription.

use axum::{
    extract::{Extension, State},
    Json,
};
use nitp_billing::{subscription_fee, PaymentCheckout};
use nitp_shared::{MembershipGrade, Subscription};
use serde::Serialize;

use crate::{auth::AuthUser, error::ApiResult, routes::current_member, state::AppState};

#[derive(Debug, Serialize)]
pub struct GradeFee {
    pub grade: MembershipGrade,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct ActiveSubscriptionResponse {
    pub active: bool,
    pub subscription: Option<Subscription>,
}

pub async fn fees() -> Json<Vec<GradeFee>> {
    Json(
        MembershipGrade::all()
            .iter()
            .map(|grade| GradeFee {
                grade: *grade,
                amount: subscription_fee(*grade),
            })
            .collect(),
    )
}

pub async fn history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let member = current_member(&state, &auth_user).await?;
    Ok(Json(state.billing.subscriptions.history(member.id).await?))
}

pub async fn active(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ActiveSubscriptionResponse>> {
    let member = current_member(&state, &auth_user).await?;
    let subscription = state
        .billing
        .subscriptions
        .get_active_subscription(member.id)
        .await?;

    Ok(Json(ActiveSubscriptionResponse {
        active: subscription.is_some(),
        subscription,
    }))
}

pub async fn renew(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PaymentCheckout>> {
    let member = current_member(&state, &auth_user).await?;
    let checkout = state
        .billing
        .subscriptions
        .start_renewal(member.id, &auth_user.email)
        .await?;

    tracing::info!(
        member_id = %member.id,
        reference = %checkout.reference,
        amount = checkout.amount,
        "Renewal checkout opened"
    );
    Ok(Json(checkout))
}
