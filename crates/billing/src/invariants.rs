//! Billing Invariants Module
//!
//! Runnable consistency checks over the membership ledger. Each check is a
//! single read-only SQL query; a violation carries enough context to find
//! the rows involved.
//!
//! Run after incidents, after manual data fixes, and daily from the worker.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Member(s) affected
    pub member_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money taken without the paid-for effect, or balances corrupted
    Critical,
    /// Member-visible inconsistency
    High,
    /// Expected to self-heal on the next worker run
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Highest severity present, if any
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        [
            ViolationSeverity::Critical,
            ViolationSeverity::High,
            ViolationSeverity::Medium,
            ViolationSeverity::Low,
        ]
        .into_iter()
        .find(|s| self.violations.iter().any(|v| v.severity == *s))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OverlappingPeriodsRow {
    member_id: Uuid,
    period_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    member_id: Uuid,
    membership_id: String,
    status: String,
    has_current_period: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeCreditsRow {
    member_id: Uuid,
    credits: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingEffectRow {
    transaction_id: Uuid,
    member_id: Uuid,
    reference: String,
    tx_type: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCertificateRow {
    application_id: Uuid,
    member_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingRow {
    transaction_id: Uuid,
    member_id: Uuid,
    reference: String,
    created_at: OffsetDateTime,
    last_error: Option<String>,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
    stale_after: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stale_after: Duration::hours(24),
        }
    }

    /// Age after which a Pending transaction is reported
    pub fn with_stale_threshold(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: at most one period contains the current instant
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverlappingPeriodsRow> = sqlx::query_as(
            r#"
            SELECT member_id, COUNT(*) AS period_count
            FROM subscriptions
            WHERE start_date <= NOW() AND end_date > NOW()
            GROUP BY member_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                member_ids: vec![row.member_id],
                description: format!(
                    "Member has {} subscription periods covering now (expected 1)",
                    row.period_count
                ),
                context: serde_json::json!({ "period_count": row.period_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Active iff a current period exists
    ///
    /// Suspended members are excluded. The hourly expiry sweep closes the
    /// Active-without-period gap, so that direction is Medium.
    async fn check_member_status_matches_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT m.id AS member_id, m.membership_id, m.status,
                   EXISTS (
                       SELECT 1 FROM subscriptions s
                       WHERE s.member_id = m.id AND s.start_date <= NOW() AND s.end_date > NOW()
                   ) AS has_current_period
            FROM members m
            WHERE m.status <> 'suspended'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| (row.status == "active") != row.has_current_period)
            .map(|row| InvariantViolation {
                invariant: "member_status_matches_subscription".to_string(),
                member_ids: vec![row.member_id],
                description: if row.has_current_period {
                    format!(
                        "Member {} is '{}' but has a paid current period",
                        row.membership_id, row.status
                    )
                } else {
                    format!(
                        "Member {} is active without a current period",
                        row.membership_id
                    )
                },
                context: serde_json::json!({
                    "membership_id": row.membership_id,
                    "status": row.status,
                    "has_current_period": row.has_current_period,
                }),
                severity: if row.has_current_period {
                    ViolationSeverity::High
                } else {
                    ViolationSeverity::Medium
                },
            })
            .collect())
    }

    /// Invariant 3: credit balances are never negative
    async fn check_non_negative_credits(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeCreditsRow> =
            sqlx::query_as("SELECT id AS member_id, credits FROM members WHERE credits < 0")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_credits".to_string(),
                member_ids: vec![row.member_id],
                description: format!("Member credit balance is {}", row.credits),
                context: serde_json::json!({ "credits": row.credits }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: every Success transaction has its effect
    ///
    /// Credit purchases leave no row to join against and are not checked.
    async fn check_settled_transactions_have_effect(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingEffectRow> = sqlx::query_as(
            r#"
            SELECT t.id AS transaction_id, t.member_id, t.reference, t.tx_type
            FROM transactions t
            WHERE t.status = 'success'
              AND (
                  (t.tx_type = 'subscription' AND NOT EXISTS (
                      SELECT 1 FROM subscriptions s WHERE s.transaction_id = t.id
                  ))
                  OR (t.tx_type = 'application_fee' AND NOT EXISTS (
                      SELECT 1 FROM applications a
                      WHERE a.id::text = t.metadata->>'application_id'
                        AND a.status IN ('approved', 'completed')
                  ))
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "settled_transactions_have_effect".to_string(),
                member_ids: vec![row.member_id],
                description: format!(
                    "Transaction {} ({}) is Success but its effect is missing",
                    row.reference, row.tx_type
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "reference": row.reference,
                    "tx_type": row.tx_type,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Approved and Completed applications carry a certificate
    async fn check_settled_applications_have_certificate(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCertificateRow> = sqlx::query_as(
            r#"
            SELECT id AS application_id, member_id, status
            FROM applications
            WHERE status IN ('approved', 'completed') AND certificate_number IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "settled_applications_have_certificate".to_string(),
                member_ids: vec![row.member_id],
                description: format!(
                    "Application {} is '{}' without a certificate number",
                    row.application_id, row.status
                ),
                context: serde_json::json!({
                    "application_id": row.application_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: nothing stays Pending past the stale threshold
    async fn check_stale_pending_transactions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = OffsetDateTime::now_utc() - self.stale_after;
        let rows: Vec<StalePendingRow> = sqlx::query_as(
            r#"
            SELECT id AS transaction_id, member_id, reference, created_at, last_error
            FROM transactions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_pending_transactions".to_string(),
                member_ids: vec![row.member_id],
                description: format!(
                    "Transaction {} pending since {}",
                    row.reference, row.created_at
                ),
                severity: if row.last_error.is_some() {
                    ViolationSeverity::Medium
                } else {
                    ViolationSeverity::Low
                },
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "reference": row.reference,
                    "last_error": row.last_error,
                }),
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_subscription" => self.check_single_current_subscription().await,
            "member_status_matches_subscription" => {
                self.check_member_status_matches_subscription().await
            }
            "non_negative_credits" => self.check_non_negative_credits().await,
            "settled_transactions_have_effect" => {
                self.check_settled_transactions_have_effect().await
            }
            "settled_applications_have_certificate" => {
                self.check_settled_applications_have_certificate().await
            }
            "stale_pending_transactions" => self.check_stale_pending_transactions().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_subscription",
            "member_status_matches_subscription",
            "non_negative_credits",
            "settled_transactions_have_effect",
            "settled_applications_have_certificate",
            "stale_pending_transactions",
        ]
    }
}
