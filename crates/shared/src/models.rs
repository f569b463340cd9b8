//! Typed entity records
//!
//! Every enum is persisted as lowercase snake_case TEXT; `as_str` and
//! `FromStr` are the only conversions used by the storage layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A stored enum value that does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn all() -> &'static [$name] {
                &[$($name::$variant,)+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

// =============================================================================
// Members
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    Individual,
    Corporate,
}

text_enum!(MemberType, "member type", {
    Individual => "individual",
    Corporate => "corporate",
});

/// Membership grade; keys the annual subscription fee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipGrade {
    Student,
    Associate,
    Professional,
    Fellow,
}

text_enum!(MembershipGrade, "membership grade", {
    Student => "student",
    Associate => "associate",
    Professional => "professional",
    Fellow => "fellow",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Pending,
    Active,
    Expired,
    Suspended,
}

text_enum!(MemberStatus, "member status", {
    Pending => "pending",
    Active => "active",
    Expired => "expired",
    Suspended => "suspended",
});

/// Personal, educational and professional attributes of a member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub full_name: String,
    pub phone: Option<String>,
    pub state_of_residence: Option<String>,
    pub institution: Option<String>,
    pub qualification: Option<String>,
    pub graduation_year: Option<i32>,
    pub employer: Option<String>,
    pub specialization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub membership_id: String,
    pub member_type: MemberType,
    pub grade: MembershipGrade,
    pub status: MemberStatus,
    pub credits: i64,
    pub profile: MemberProfile,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Subscriptions
// =============================================================================

/// One paid membership period. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub member_id: Uuid,
    pub grade: MembershipGrade,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    pub transaction_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Subscription {
    /// Half-open interval `[start_date, end_date)`
    pub fn covers(&self, at: OffsetDateTime) -> bool {
        self.start_date <= at && at < self.end_date
    }
}

// =============================================================================
// Applications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    /// Site Analysis Report
    Sar,
    /// Environmental Impact Assessment Report
    Eiar,
}

text_enum!(ApplicationType, "application type", {
    Sar => "sar",
    Eiar => "eiar",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicantType {
    Individual,
    Corporate,
}

text_enum!(ApplicantType, "applicant type", {
    Individual => "individual",
    Corporate => "corporate",
});

impl From<MemberType> for ApplicantType {
    fn from(value: MemberType) -> Self {
        match value {
            MemberType::Individual => ApplicantType::Individual,
            MemberType::Corporate => ApplicantType::Corporate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Draft,
    Submitted,
    UnderReview,
    PaymentPending,
    Approved,
    Rejected,
    Completed,
}

text_enum!(ApplicationStatus, "application status", {
    Draft => "draft",
    Submitted => "submitted",
    UnderReview => "under_review",
    PaymentPending => "payment_pending",
    Approved => "approved",
    Rejected => "rejected",
    Completed => "completed",
});

impl ApplicationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Approved | ApplicationStatus::Rejected | ApplicationStatus::Completed
        )
    }

    /// The complete transition table of the application lifecycle
    pub fn can_transition_to(&self, next: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        matches!(
            (self, next),
            (Draft, Submitted)
                | (Submitted, UnderReview)
                | (UnderReview, Approved)
                | (UnderReview, Rejected)
                | (UnderReview, PaymentPending)
                | (PaymentPending, Completed)
                | (PaymentPending, UnderReview)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Application {
    pub id: Uuid,
    pub member_id: Uuid,
    pub application_type: ApplicationType,
    pub applicant_type: ApplicantType,
    pub title: String,
    pub site_address: String,
    pub status: ApplicationStatus,
    pub amount: i64,
    pub certificate_number: Option<String>,
    pub certificate_url: Option<String>,
    pub rejection_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationDocument {
    pub id: Uuid,
    pub application_id: Uuid,
    pub doc_type: String,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Subscription,
    ApplicationFee,
    CreditPurchase,
    Other,
}

text_enum!(TransactionType, "transaction type", {
    Subscription => "subscription",
    ApplicationFee => "application_fee",
    CreditPurchase => "credit_purchase",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

text_enum!(TransactionStatus, "transaction status", {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    Refunded => "refunded",
});

/// Which downstream entity a payment settles, stored with the transaction
/// and sent to the gateway as metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentPurpose {
    Subscription {
        member_id: Uuid,
        grade: MembershipGrade,
    },
    Application {
        application_id: Uuid,
    },
    Credits {
        member_id: Uuid,
        credits: i64,
    },
    #[serde(other)]
    Unknown,
}

impl PaymentPurpose {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            PaymentPurpose::Subscription { .. } => TransactionType::Subscription,
            PaymentPurpose::Application { .. } => TransactionType::ApplicationFee,
            PaymentPurpose::Credits { .. } => TransactionType::CreditPurchase,
            PaymentPurpose::Unknown => TransactionType::Other,
        }
    }

    /// Decode stored metadata; anything unrecognised becomes `Unknown`
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(PaymentPurpose::Unknown)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "type": "unknown" }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub member_id: Uuid,
    pub reference: String,
    pub tx_type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub purpose: PaymentPurpose,
    pub gateway_response: Option<serde_json::Value>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub settled_at: Option<OffsetDateTime>,
}

// =============================================================================
// Tools
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub credit_cost: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUsage {
    pub id: Uuid,
    pub member_id: Uuid,
    pub tool_id: Uuid,
    pub credits_used: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_status_text_round_trip() {
        for status in ApplicationStatus::all() {
            assert_eq!(status.as_str().parse::<ApplicationStatus>().unwrap(), *status);
        }
        assert_eq!(
            "UNDER_REVIEW".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::UnderReview
        );
        let err = "archived".parse::<ApplicationStatus>().unwrap_err();
        assert_eq!(err.kind, "application status");
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ApplicationStatus::all() {
            if from.is_terminal() {
                for to in ApplicationStatus::all() {
                    assert!(!from.can_transition_to(*to), "{} -> {}", from, to);
                }
            }
        }
    }

    #[test]
    fn test_draft_only_moves_to_submitted() {
        let exits: Vec<_> = ApplicationStatus::all()
            .iter()
            .filter(|to| ApplicationStatus::Draft.can_transition_to(**to))
            .collect();
        assert_eq!(exits, vec![&ApplicationStatus::Submitted]);
    }

    #[test]
    fn test_subscription_interval_is_half_open() {
        let sub = Subscription {
            id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            grade: MembershipGrade::Professional,
            amount: 50_000,
            start_date: datetime!(2026-01-01 00:00 UTC),
            end_date: datetime!(2027-01-01 00:00 UTC),
            transaction_id: Uuid::new_v4(),
            created_at: datetime!(2026-01-01 00:00 UTC),
        };
        assert!(sub.covers(datetime!(2026-01-01 00:00 UTC)));
        assert!(sub.covers(datetime!(2026-12-31 23:59 UTC)));
        assert!(!sub.covers(datetime!(2027-01-01 00:00 UTC)));
        assert!(!sub.covers(datetime!(2025-12-31 23:59 UTC)));
    }

    #[test]
    fn test_purpose_metadata_shape() {
        let member_id = Uuid::new_v4();
        let purpose = PaymentPurpose::Credits {
            member_id,
            credits: 250,
        };
        let json = purpose.to_json();
        assert_eq!(json["type"], "credits");
        assert_eq!(json["credits"], 250);
        assert_eq!(PaymentPurpose::from_json(&json), purpose);
        assert_eq!(purpose.transaction_type(), TransactionType::CreditPurchase);
    }

    #[test]
    fn test_unrecognised_purpose_is_unknown() {
        let json = serde_json::json!({ "type": "donation", "campaign": "2026" });
        assert_eq!(PaymentPurpose::from_json(&json), PaymentPurpose::Unknown);
        assert_eq!(
            PaymentPurpose::from_json(&serde_json::json!("not an object")),
            PaymentPurpose::Unknown
        );
    }
}
