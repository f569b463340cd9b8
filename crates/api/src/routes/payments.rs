//! Payment verification and gateway webhook
//!
//! Both entry points funnel into the same reconciler, so a payment settled
//! by the redirect and again by the webhook is applied once.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use nitp_billing::{ReconcileOutcome, SIGNATURE_HEADER};
use serde::Deserialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub reference: String,
}

/// Redirect target after checkout. Business outcomes are all 200.
pub async fn verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<ReconcileOutcome>> {
    let reference = query.reference.trim();
    if reference.is_empty() {
        return Err(ApiError::Validation("reference is required".to_string()));
    }

    let outcome = state
        .billing
        .reconciler
        .verify_and_apply(reference)
        .await
        .map_err(ApiError::from_settlement)?;
    Ok(Json(outcome))
}

/// Signed gateway callback over the raw body
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let handled = state
        .billing
        .webhooks
        .handle(&body, signature)
        .await
        .map_err(ApiError::from_settlement)?;
    match handled {
        Some(outcome) => {
            tracing::debug!(outcome = ?outcome, "Webhook processed");
        }
        None => {
            tracing::debug!("Webhook acknowledged without reconciliation");
        }
    }
    Ok(StatusCode::OK)
}
