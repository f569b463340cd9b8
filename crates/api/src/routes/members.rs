//! Member profile routes

use axum::{
    extract::{Extension, State},
    Json,
};
use nitp_shared::{Member, MemberProfile};

use crate::{auth::AuthUser, error::ApiResult, routes::current_member, state::AppState};

pub async fn get_me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Member>> {
    Ok(Json(current_member(&state, &auth_user).await?))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(profile): Json<MemberProfile>,
) -> ApiResult<Json<Member>> {
    let member = current_member(&state, &auth_user).await?;
    let updated = state
        .billing
        .members
        .update_profile(member.id, profile)
        .await?;
    tracing::info!(member_id = %member.id, "Member profile updated");
    Ok(Json(updated))
}
