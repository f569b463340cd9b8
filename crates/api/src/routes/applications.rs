//! SAR / EIAR application routes

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use nitp_billing::{ApplicationFee, CreateApplication, PaymentCheckout};
use nitp_shared::{ApplicantType, Application, ApplicationDocument, ApplicationType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    routes::current_member,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct FeeQuery {
    pub application_type: Option<ApplicationType>,
    pub applicant_type: Option<ApplicantType>,
}

#[derive(Debug, Deserialize)]
pub struct AddDocumentRequest {
    pub doc_type: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ApplicationDetail {
    #[serde(flatten)]
    pub application: Application,
    pub documents: Vec<ApplicationDocument>,
}

/// The fee table, or a single fee when both types are given
pub async fn fees(
    State(state): State<AppState>,
    Query(query): Query<FeeQuery>,
) -> ApiResult<Json<Vec<ApplicationFee>>> {
    let workflow = &state.billing.applications;

    if let (Some(application_type), Some(applicant_type)) =
        (query.application_type, query.applicant_type)
    {
        let fee = workflow.calculate_application_fee(application_type, applicant_type)?;
        return Ok(Json(vec![fee]));
    }

    let fees = workflow
        .fee_schedule()
        .entries()
        .iter()
        .filter(|e| query.application_type.map_or(true, |t| t == e.application_type))
        .filter(|e| query.applicant_type.map_or(true, |t| t == e.applicant_type))
        .map(|e| workflow.calculate_application_fee(e.application_type, e.applicant_type))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(fees))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Application>>> {
    let member = current_member(&state, &auth_user).await?;
    Ok(Json(
        state.billing.applications.list_for_member(member.id).await?,
    ))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateApplication>,
) -> ApiResult<(StatusCode, Json<Application>)> {
    let member = current_member(&state, &auth_user).await?;
    let application = state.billing.applications.create(member.id, req).await?;
    Ok((StatusCode::CREATED, Json(application)))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApplicationDetail>> {
    let member = current_member(&state, &auth_user).await?;
    let application = state
        .billing
        .applications
        .get_for_member(id, member.id)
        .await?;
    let documents = state.billing.applications.documents(id).await?;
    Ok(Json(ApplicationDetail {
        application,
        documents,
    }))
}

pub async fn add_document(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddDocumentRequest>,
) -> ApiResult<(StatusCode, Json<ApplicationDocument>)> {
    let member = current_member(&state, &auth_user).await?;
    let document = state
        .billing
        .applications
        .add_document(id, member.id, &req.doc_type, &req.url)
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn submit(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Application>> {
    let member = current_member(&state, &auth_user).await?;
    Ok(Json(
        state.billing.applications.submit(id, member.id).await?,
    ))
}

pub async fn pay(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentCheckout>> {
    let member = current_member(&state, &auth_user).await?;
    let checkout = state
        .billing
        .applications
        .pay_for_application(id, member.id, &auth_user.email)
        .await?;
    Ok(Json(checkout))
}
