//! Planning tools and credit routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use nitp_billing::{credits_to_naira, PaymentCheckout, ToolUseReceipt};
use nitp_shared::Tool;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, routes::current_member, state::AppState};

#[derive(Debug, Serialize)]
pub struct CreditBalance {
    pub credits: i64,
    /// Naira value of the balance at the purchase rate
    pub naira_value: i64,
}

#[derive(Debug, Deserialize)]
pub struct BuyCreditsRequest {
    /// Amount to pay, in Naira
    pub amount: i64,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Tool>>> {
    Ok(Json(state.billing.credits.list_tools().await?))
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CreditBalance>> {
    let member = current_member(&state, &auth_user).await?;
    let credits = state.billing.credits.balance(member.id).await?;
    Ok(Json(CreditBalance {
        credits,
        naira_value: credits_to_naira(credits),
    }))
}

pub async fn use_tool(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tool_id): Path<Uuid>,
) -> ApiResult<Json<ToolUseReceipt>> {
    let member = current_member(&state, &auth_user).await?;
    Ok(Json(state.billing.credits.use_tool(member.id, tool_id).await?))
}

pub async fn buy_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<BuyCreditsRequest>,
) -> ApiResult<Json<PaymentCheckout>> {
    let member = current_member(&state, &auth_user).await?;
    let checkout = state
        .billing
        .credits
        .start_purchase(member.id, &auth_user.email, req.amount)
        .await?;
    Ok(Json(checkout))
}
