//! Registration, login and session routes

use axum::{
    extract::{Extension, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use nitp_shared::{Member, MemberProfile, MemberType, MembershipGrade};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{identity, sessions, AuthUser, Identity},
    error::{ApiError, ApiResult},
    routes::{extract_client_ip, extract_user_agent},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    pub member_type: MemberType,
    pub grade: MembershipGrade,
    pub profile: MemberProfile,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Email, username or membership ID
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutQuery {
    /// Revoke every session of the identity, not just this one
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub identity: Identity,
    pub member: Option<Member>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub identity: Identity,
    pub member: Option<Member>,
}

async fn issue_session(
    state: &AppState,
    identity: &Identity,
    headers: &HeaderMap,
) -> ApiResult<(String, OffsetDateTime)> {
    let issued = state
        .jwt_manager
        .generate_access_token(identity.id, &identity.email, &identity.role)
        .map_err(|e| ApiError::Internal(format!("token signing failed: {}", e)))?;

    sessions::save_session(
        &state.pool,
        identity.id,
        &issued.jti,
        issued.expires_at,
        extract_client_ip(headers).as_deref(),
        extract_user_agent(headers).as_deref(),
    )
    .await?;

    Ok((issued.token, issued.expires_at))
}

async fn member_for(state: &AppState, identity_id: Uuid) -> ApiResult<Option<Member>> {
    match state.billing.members.get_by_identity(identity_id).await {
        Ok(member) => Ok(Some(member)),
        Err(nitp_billing::BillingError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create an identity and its Pending member record
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let identity =
        identity::create_identity(&state.pool, &req.email, &req.username, &req.password).await?;

    let member = match state
        .billing
        .members
        .register(identity.id, req.member_type, req.grade, req.profile)
        .await
    {
        Ok(member) => member,
        Err(e) => {
            tracing::warn!(identity_id = %identity.id, error = %e, "Member creation failed, removing identity");
            identity::delete_identity(&state.pool, identity.id).await?;
            return Err(e.into());
        }
    };

    let (token, expires_at) = issue_session(&state, &identity, &headers).await?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            expires_at,
            identity,
            member: Some(member),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    if req.identifier.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation(
            "identifier and password are required".to_string(),
        ));
    }

    let identity = identity::authenticate(&state.pool, &req.identifier, &req.password).await?;
    let (token, expires_at) = issue_session(&state, &identity, &headers).await?;
    let member = member_for(&state, identity.id).await?;

    Ok(Json(AuthResponse {
        token,
        expires_at,
        identity,
        member,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<LogoutQuery>,
) -> ApiResult<StatusCode> {
    if query.all {
        let revoked =
            sessions::revoke_all_sessions(&state.pool, auth_user.identity_id, "logout_all").await?;
        tracing::info!(identity_id = %auth_user.identity_id, revoked, "All sessions revoked");
    } else {
        sessions::revoke_session(&state.pool, &auth_user.jti, "logout").await?;
        tracing::info!(identity_id = %auth_user.identity_id, "Session revoked");
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MeResponse>> {
    let identity = identity::get_identity(&state.pool, auth_user.identity_id).await?;
    let member = member_for(&state, identity.id).await?;
    Ok(Json(MeResponse { identity, member }))
}
