//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{identity::ROLE_ADMIN, jwt::JwtManager, sessions};

/// Cookie set by the portal frontend for browser sessions
const AUTH_COOKIE: &str = "nitp_auth_token";

/// Authenticated identity extracted from a session-backed JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub identity_id: Uuid,
    pub email: String,
    pub role: String,
    /// JTI of the session this request was authenticated with
    pub jti: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

fn extract_token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(AUTH_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(String::from)
            })
        })
}

/// Bearer token from the Authorization header, falling back to the auth cookie
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    extract_token_from_cookie(headers)
}

/// Middleware that requires an authenticated identity
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(request.headers()) {
        Some(token) => authenticate_jwt(&auth_state, &token).await,
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                identity_id = %auth_user.identity_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires one of `required_roles`
pub async fn require_role(
    required_roles: &[&str],
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_result = match extract_bearer_token(request.headers()) {
        Some(token) => authenticate_jwt(&auth_state, &token).await,
        None => return AuthError::MissingAuth.into_response(),
    };

    match auth_result {
        Ok(auth_user) => {
            if !required_roles.contains(&auth_user.role.as_str()) {
                tracing::warn!(
                    identity_id = %auth_user.identity_id,
                    role = %auth_user.role,
                    path = %request.uri().path(),
                    "Role check failed"
                );
                return AuthError::InsufficientPermissions.into_response();
            }

            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Middleware for the admin surface
pub async fn require_admin(
    state: State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    require_role(&[ROLE_ADMIN], state, request, next).await
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            AuthError::InvalidToken
        })?;

    let session_valid = sessions::is_session_valid(&auth_state.pool, &claims.jti, claims.sub)
        .await
        .map_err(|_| AuthError::DatabaseError)?;

    if !session_valid {
        tracing::warn!(jti = %claims.jti, identity_id = %claims.sub, "Session revoked or expired");
        return Err(AuthError::InvalidToken);
    }

    Ok(AuthUser {
        identity_id: claims.sub,
        email: claims.email,
        role: claims.role,
        jti: claims.jti,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
            AuthError::DatabaseError => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
