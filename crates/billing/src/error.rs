//! Billing error types

use nitp_shared::{ApplicantType, ApplicationStatus, ApplicationType, ParseEnumError};
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not permitted: {0}")]
    Forbidden(String),

    #[error("Subscription expired or not found")]
    SubscriptionRequired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: application is {current}, expected {expected}")]
    InvalidState {
        current: ApplicationStatus,
        expected: &'static str,
    },

    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("No fee schedule defined for {application_type} / {applicant_type}")]
    NoFeeSchedule {
        application_type: ApplicationType,
        applicant_type: ApplicantType,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The gateway answered but rejected or failed the request
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// The gateway could not be reached or answered with a server error
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Duplicate transaction reference: {0}")]
    DuplicateReference(String),

    #[error("Duplicate membership id: {0}")]
    DuplicateMembershipId(String),

    #[error("Downstream effect could not be applied for transaction {transaction_id}: {reason}")]
    SettlementRejected { transaction_id: Uuid, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayUnavailable(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(err: ParseEnumError) -> Self {
        BillingError::Internal(format!("Corrupt stored value: {}", err))
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            BillingError::GatewayUnavailable(err.to_string())
        } else {
            BillingError::Gateway(err.to_string())
        }
    }
}
