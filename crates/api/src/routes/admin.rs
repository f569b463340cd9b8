//! Registrar routes
//!
//! Protected by the admin role check in the router.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use nitp_billing::{InvariantCheckSummary, ReconcileOutcome};
use nitp_shared::{Application, ApplicationStatus, Transaction};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListApplicationsQuery {
    /// Defaults to submitted applications awaiting review
    pub status: Option<ApplicationStatus>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

// =============================================================================
// Applications
// =============================================================================

pub async fn list_applications(
    State(state): State<AppState>,
    Query(query): Query<ListApplicationsQuery>,
) -> ApiResult<Json<Vec<Application>>> {
    let status = query.status.unwrap_or(ApplicationStatus::Submitted);
    Ok(Json(
        state.billing.applications.list_by_status(status).await?,
    ))
}

pub async fn begin_review(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Application>> {
    let application = state.billing.applications.begin_review(id).await?;
    tracing::info!(
        admin_id = %auth_user.identity_id,
        application_id = %id,
        "Application taken under review"
    );
    Ok(Json(application))
}

pub async fn reject(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<Json<Application>> {
    let application = state.billing.applications.reject(id, &req.reason).await?;
    tracing::info!(
        admin_id = %auth_user.identity_id,
        application_id = %id,
        "Application rejected"
    );
    Ok(Json(application))
}

// =============================================================================
// Transactions
// =============================================================================

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Transaction>> {
    state
        .billing
        .transaction(&reference)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Transaction {} not found", reference)))
}

/// Re-run verification for a transaction, e.g. one flagged for review
pub async fn reconcile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(reference): Path<String>,
) -> ApiResult<Json<ReconcileOutcome>> {
    tracing::info!(
        admin_id = %auth_user.identity_id,
        reference = %reference,
        "Manual reconciliation requested"
    );
    let outcome = state
        .billing
        .reconciler
        .verify_and_apply(&reference)
        .await
        .map_err(ApiError::from_settlement)?;
    Ok(Json(outcome))
}

// =============================================================================
// Invariants
// =============================================================================

pub async fn invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.invariants.run_all_checks().await?;
    if let Some(severity) = summary.worst_severity() {
        tracing::warn!(
            violations = summary.violations.len(),
            worst = %severity,
            "Invariant violations found"
        );
    }
    Ok(Json(summary))
}
