//! Scheduled job bodies
//!
//! Each job logs its own outcome and never returns an error to the
//! scheduler; a failed run is retried on the next tick.

use nitp_billing::{
    BillingService, InvariantCheckSummary, InvariantChecker, StaleSweepReport, ViolationSeverity,
};
use time::Duration;
use tracing::{error, info, warn};

const DEFAULT_STALE_PENDING_MINUTES: i64 = 30;
/// Upper bound on transactions re-verified per sweep
pub const STALE_SWEEP_LIMIT: i64 = 200;

#[derive(Debug, thiserror::Error)]
#[error("STALE_PENDING_MINUTES must be a positive integer, got {0:?}")]
pub struct InvalidStaleMinutes(String);

/// Age at which a Pending transaction is re-verified
pub fn stale_pending_threshold(raw: Option<&str>) -> Result<Duration, InvalidStaleMinutes> {
    match raw {
        None => Ok(Duration::minutes(DEFAULT_STALE_PENDING_MINUTES)),
        Some(value) => match value.trim().parse::<i64>() {
            Ok(minutes) if minutes > 0 => Ok(Duration::minutes(minutes)),
            _ => Err(InvalidStaleMinutes(value.to_string())),
        },
    }
}

pub async fn expire_lapsed_members(billing: &BillingService) {
    match billing.members.expire_lapsed_members().await {
        Ok(expired) => info!(expired = expired.len(), "Membership expiry sweep complete"),
        Err(e) => error!(error = %e, "Membership expiry sweep failed"),
    }
}

pub async fn reconcile_stale_pending(billing: &BillingService, older_than: Duration) {
    match billing
        .reconciler
        .reconcile_stale_pending(older_than, STALE_SWEEP_LIMIT)
        .await
    {
        Ok(report) => log_sweep_report(&report),
        Err(e) => error!(error = %e, "Stale pending reconciliation failed"),
    }
}

fn log_sweep_report(report: &StaleSweepReport) {
    if report.examined == 0 {
        info!("No stale pending transactions");
        return;
    }

    info!(
        examined = report.examined,
        applied = report.applied,
        failed = report.failed,
        still_pending = report.still_pending,
        needs_review = report.needs_review,
        errors = report.errors,
        "Stale pending reconciliation complete"
    );

    if report.needs_review > 0 {
        warn!(
            needs_review = report.needs_review,
            "Transactions flagged for manual review"
        );
    }
}

pub async fn run_invariant_checks(checker: &InvariantChecker) {
    match checker.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Invariant checks failed to run"),
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All billing invariants hold");
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                members = ?violation.member_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                members = ?violation.member_ids,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        worst = ?summary.worst_severity(),
        "Billing invariant violations found"
    );
}
