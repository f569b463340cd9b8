//! HTTP routes

pub mod admin;
pub mod applications;
pub mod auth;
pub mod members;
pub mod payments;
pub mod subscriptions;
pub mod tools;

#[cfg(test)]
mod tests;

use axum::{
    http::HeaderMap,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use nitp_shared::Member;
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth, AuthUser},
    error::ApiResult,
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/subscriptions/fees", get(subscriptions::fees))
        .route("/applications/fees", get(applications::fees))
        .route("/payments/verify", get(payments::verify))
        .route("/payments/webhook", post(payments::webhook));

    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/members/me", get(members::get_me))
        .route("/members/me/profile", put(members::update_profile))
        .route("/subscriptions", get(subscriptions::history))
        .route("/subscriptions/active", get(subscriptions::active))
        .route("/subscriptions/renew", post(subscriptions::renew))
        .route(
            "/applications",
            get(applications::list).post(applications::create),
        )
        .route("/applications/{id}", get(applications::get_one))
        .route(
            "/applications/{id}/documents",
            post(applications::add_document),
        )
        .route("/applications/{id}/submit", post(applications::submit))
        .route("/applications/{id}/pay", post(applications::pay))
        .route("/tools", get(tools::list))
        .route("/tools/credits", get(tools::balance))
        .route("/tools/credits/buy", post(tools::buy_credits))
        .route("/tools/{id}/use", post(tools::use_tool))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    let admin = Router::new()
        .route("/applications", get(admin::list_applications))
        .route("/applications/{id}/review", post(admin::begin_review))
        .route("/applications/{id}/reject", post(admin::reject))
        .route("/transactions/{reference}", get(admin::get_transaction))
        .route(
            "/transactions/{reference}/reconcile",
            post(admin::reconcile),
        )
        .route("/invariants", get(admin::invariants))
        .route_layer(middleware::from_fn_with_state(auth_state, require_admin));

    Router::new()
        .route("/health", get(health))
        .nest(
            "/api/v1",
            public.merge(protected).nest("/admin", admin),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Client IP from proxy headers (X-Forwarded-For, CF-Connecting-IP, X-Real-IP)
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    ["X-Forwarded-For", "CF-Connecting-IP", "X-Real-IP"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

pub(crate) fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Member record of the authenticated identity
pub(crate) async fn current_member(state: &AppState, auth_user: &AuthUser) -> ApiResult<Member> {
    Ok(state
        .billing
        .members
        .get_by_identity(auth_user.identity_id)
        .await?)
}
