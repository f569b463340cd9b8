//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nitp_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Subscription expired or not found")]
    SubscriptionRequired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient credits")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Payment gateway unavailable")]
    GatewayUnavailable,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::SubscriptionRequired => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) | ApiError::InsufficientCredits { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::GatewayUnavailable => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                json!({
                    "error": "Internal server error",
                    "code": status.as_u16()
                })
            }
            ApiError::InsufficientCredits { balance, required } => json!({
                "error": "Insufficient credits",
                "code": status.as_u16(),
                "balance": balance,
                "required": required
            }),
            ApiError::Unauthorized => json!({
                "error": "Authentication required",
                "code": status.as_u16()
            }),
            ApiError::Forbidden(message)
            | ApiError::NotFound(message)
            | ApiError::Validation(message)
            | ApiError::Conflict(message) => json!({
                "error": message,
                "code": status.as_u16()
            }),
            ApiError::SubscriptionRequired | ApiError::GatewayUnavailable => json!({
                "error": self.to_string(),
                "code": status.as_u16()
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Forbidden(message) => ApiError::Forbidden(message),
            BillingError::SubscriptionRequired => ApiError::SubscriptionRequired,
            BillingError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            BillingError::InsufficientCredits { balance, required } => {
                ApiError::InsufficientCredits { balance, required }
            }
            e @ (BillingError::InvalidState { .. } | BillingError::NoFeeSchedule { .. }) => {
                ApiError::Validation(e.to_string())
            }
            BillingError::InvalidInput(message) | BillingError::Gateway(message) => {
                ApiError::Validation(message)
            }
            BillingError::InvalidSignature => ApiError::Unauthorized,
            BillingError::GatewayUnavailable(detail) => {
                tracing::warn!(error = %detail, "Payment gateway unavailable at checkout");
                ApiError::Validation(
                    "Payment gateway is unavailable, please try again later".to_string(),
                )
            }
            BillingError::Database(detail) => ApiError::Database(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    /// Mapping for the verify and webhook paths, where an unreachable gateway
    /// is a 502 so the caller (or the gateway itself) retries later.
    pub fn from_settlement(err: BillingError) -> Self {
        match err {
            BillingError::GatewayUnavailable(detail) => {
                tracing::warn!(error = %detail, "Payment gateway unavailable during settlement");
                ApiError::GatewayUnavailable
            }
            other => other.into(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nitp_shared::{ApplicantType, ApplicationStatus, ApplicationType};

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_subscription_required_is_forbidden() {
        let (status, body) = body_json(BillingError::SubscriptionRequired.into()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("subscription expired"));
        assert_eq!(body["code"], 403);
    }

    #[tokio::test]
    async fn test_insufficient_credits_carries_balance() {
        let (status, body) = body_json(
            BillingError::InsufficientCredits {
                balance: 50,
                required: 100,
            }
            .into(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["balance"], 50);
        assert_eq!(body["required"], 100);
    }

    #[tokio::test]
    async fn test_internal_detail_not_leaked() {
        let (status, body) =
            body_json(BillingError::Database("relation \"members\" missing".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_gateway_message_surfaced() {
        let (status, body) =
            body_json(BillingError::Gateway("Invalid email address".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid email address");
    }

    #[test]
    fn test_gateway_unavailable_is_bad_gateway_only_for_settlement() {
        assert_eq!(
            ApiError::from(BillingError::GatewayUnavailable("timeout".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from_settlement(BillingError::GatewayUnavailable("timeout".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from_settlement(BillingError::SubscriptionRequired).status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_billing_error_statuses() {
        let cases: Vec<(BillingError, StatusCode)> = vec![
            (
                BillingError::Forbidden("not yours".into()),
                StatusCode::FORBIDDEN,
            ),
            (BillingError::NotFound("Tool".into()), StatusCode::NOT_FOUND),
            (
                BillingError::InvalidState {
                    current: ApplicationStatus::Draft,
                    expected: "under_review",
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::NoFeeSchedule {
                    application_type: ApplicationType::Sar,
                    applicant_type: ApplicantType::Corporate,
                },
                StatusCode::BAD_REQUEST,
            ),
            (BillingError::InvalidSignature, StatusCode::UNAUTHORIZED),
            (
                BillingError::GatewayUnavailable("timeout".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::DuplicateReference("NITP-1".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let label = err.to_string();
            assert_eq!(ApiError::from(err).status(), expected, "{}", label);
        }
    }
}
