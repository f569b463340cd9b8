//! Payment reconciliation
//!
//! [`PaymentReconciler::verify_and_apply`] is the only place a transaction
//! leaves Pending. It is safe to call any number of times, from the
//! callback redirect, the signed webhook, an admin or the stale sweep:
//! the transaction row is locked and re-checked inside the same unit of
//! work that applies the effect, so at most one caller ever applies it.

use std::sync::Arc;

use nitp_shared::{ApplicationStatus, MemberStatus, PaymentPurpose, Transaction, TransactionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::applications::{release_failed_payment, settle_application_payment};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{naira_to_kobo, GatewayStatus, PaymentGateway, VerifiedPayment};
use crate::store::{BillingStore, LedgerTx};
use crate::subscriptions::create_subscription;

/// What a successful settlement changed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppliedEffect {
    Subscription {
        subscription_id: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        end_date: OffsetDateTime,
    },
    Application {
        application_id: Uuid,
        status: ApplicationStatus,
        certificate_number: Option<String>,
    },
    Credits {
        member_id: Uuid,
        credits: i64,
        balance: i64,
    },
}

/// Result of one reconciliation attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Effect applied and transaction marked Success
    Applied { effect: AppliedEffect },
    /// Transaction was already final; nothing changed
    AlreadyProcessed { status: TransactionStatus },
    /// No local transaction carries this reference
    UnknownReference,
    /// Gateway reported a different reference or amount; left Pending
    AmountMismatch {
        expected_minor: i64,
        reported_minor: i64,
    },
    /// Gateway reported failure or abandonment; marked Failed
    PaymentFailed,
    /// Gateway has no final answer yet
    StillPending,
    /// Purpose not recognised; marked Success with no effect
    Ignored,
    /// Effect could not be applied; left Pending with `last_error`
    NeedsReview { reason: String },
}

impl ReconcileOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::AlreadyProcessed { .. } => "already_processed",
            ReconcileOutcome::UnknownReference => "unknown_reference",
            ReconcileOutcome::AmountMismatch { .. } => "amount_mismatch",
            ReconcileOutcome::PaymentFailed => "payment_failed",
            ReconcileOutcome::StillPending => "still_pending",
            ReconcileOutcome::Ignored => "ignored",
            ReconcileOutcome::NeedsReview { .. } => "needs_review",
        }
    }
}

/// Counts from one stale-pending sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleSweepReport {
    pub examined: usize,
    pub applied: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub needs_review: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    certificate_base_url: String,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        certificate_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            certificate_base_url: certificate_base_url.into(),
        }
    }

    /// Verify `reference` with the gateway and apply its effect exactly once
    pub async fn verify_and_apply(&self, reference: &str) -> BillingResult<ReconcileOutcome> {
        let outcome = self.reconcile(reference).await?;
        match &outcome {
            ReconcileOutcome::AmountMismatch { .. } | ReconcileOutcome::NeedsReview { .. } => {
                tracing::warn!(reference = %reference, outcome = outcome.label(), "Reconciliation needs attention");
            }
            _ => {
                tracing::info!(reference = %reference, outcome = outcome.label(), "Reconciliation finished");
            }
        }
        Ok(outcome)
    }

    async fn reconcile(&self, reference: &str) -> BillingResult<ReconcileOutcome> {
        let Some(local) = self.store.get_transaction(reference).await? else {
            return Ok(ReconcileOutcome::UnknownReference);
        };
        if local.status != TransactionStatus::Pending {
            return Ok(ReconcileOutcome::AlreadyProcessed {
                status: local.status,
            });
        }

        let payment = self.gateway.verify(reference).await?;
        if payment.status == GatewayStatus::Pending {
            return Ok(ReconcileOutcome::StillPending);
        }

        let mut tx = self.store.begin().await?;
        let Some(locked) = tx.lock_transaction(reference).await? else {
            return Ok(ReconcileOutcome::UnknownReference);
        };
        if locked.status != TransactionStatus::Pending {
            return Ok(ReconcileOutcome::AlreadyProcessed {
                status: locked.status,
            });
        }

        match payment.status {
            GatewayStatus::Pending => Ok(ReconcileOutcome::StillPending),
            GatewayStatus::Failed | GatewayStatus::Abandoned => {
                if let PaymentPurpose::Application { application_id } = &locked.purpose {
                    release_failed_payment(tx.as_mut(), *application_id).await?;
                }
                tx.settle_transaction(locked.id, TransactionStatus::Failed, Some(&payment.raw))
                    .await?;
                tx.commit().await?;
                Ok(ReconcileOutcome::PaymentFailed)
            }
            GatewayStatus::Success => self.apply_success(tx, &locked, &payment).await,
        }
    }

    async fn apply_success(
        &self,
        mut tx: Box<dyn LedgerTx>,
        locked: &Transaction,
        payment: &VerifiedPayment,
    ) -> BillingResult<ReconcileOutcome> {
        let expected_minor = naira_to_kobo(locked.amount)?;
        if payment.reference != locked.reference || payment.amount_minor != expected_minor {
            drop(tx);
            let message = format!(
                "Gateway reported reference {} amount {} kobo, expected {} kobo",
                payment.reference, payment.amount_minor, expected_minor
            );
            self.store
                .record_reconciliation_error(&locked.reference, &message)
                .await?;
            return Ok(ReconcileOutcome::AmountMismatch {
                expected_minor,
                reported_minor: payment.amount_minor,
            });
        }

        let now = OffsetDateTime::now_utc();
        match self.dispatch(tx.as_mut(), locked, now).await {
            Ok(effect) => {
                tx.settle_transaction(locked.id, TransactionStatus::Success, Some(&payment.raw))
                    .await?;
                tx.commit().await?;
                Ok(match effect {
                    Some(effect) => ReconcileOutcome::Applied { effect },
                    None => ReconcileOutcome::Ignored,
                })
            }
            Err(e) if e.is_transient() || matches!(e, BillingError::Internal(_)) => Err(e),
            Err(e) => {
                drop(tx);
                let reason = e.to_string();
                tracing::error!(
                    reference = %locked.reference,
                    transaction_id = %locked.id,
                    error = %reason,
                    "Paid transaction could not be applied"
                );
                self.store
                    .record_reconciliation_error(&locked.reference, &reason)
                    .await?;
                Ok(ReconcileOutcome::NeedsReview { reason })
            }
        }
    }

    /// Apply the locally stored purpose. `None` when there is nothing to apply.
    async fn dispatch(
        &self,
        tx: &mut dyn LedgerTx,
        locked: &Transaction,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedEffect>> {
        let rejected = |reason: String| BillingError::SettlementRejected {
            transaction_id: locked.id,
            reason,
        };

        match &locked.purpose {
            PaymentPurpose::Subscription { member_id, grade } => {
                if *member_id != locked.member_id {
                    return Err(rejected("subscription is for another member".to_string()));
                }
                let member = tx
                    .lock_member(*member_id)
                    .await?
                    .ok_or_else(|| rejected(format!("member {} does not exist", member_id)))?;

                let subscription =
                    create_subscription(tx, member.id, *grade, locked.amount, locked.id, now)
                        .await?;
                if member.status != MemberStatus::Suspended {
                    tx.set_member_status(member.id, MemberStatus::Active).await?;
                }

                Ok(Some(AppliedEffect::Subscription {
                    subscription_id: subscription.id,
                    end_date: subscription.end_date,
                }))
            }
            PaymentPurpose::Application { application_id } => {
                let application = settle_application_payment(
                    tx,
                    *application_id,
                    locked.id,
                    &self.certificate_base_url,
                    now,
                )
                .await?;
                if application.member_id != locked.member_id {
                    return Err(rejected("application belongs to another member".to_string()));
                }

                Ok(Some(AppliedEffect::Application {
                    application_id: application.id,
                    status: application.status,
                    certificate_number: application.certificate_number,
                }))
            }
            PaymentPurpose::Credits { member_id, credits } => {
                if *credits <= 0 {
                    return Err(rejected(format!("credit quantity {} is not positive", credits)));
                }
                if *member_id != locked.member_id {
                    return Err(rejected("credits are for another member".to_string()));
                }
                let balance = tx.increment_credits(*member_id, *credits).await?;

                Ok(Some(AppliedEffect::Credits {
                    member_id: *member_id,
                    credits: *credits,
                    balance,
                }))
            }
            PaymentPurpose::Unknown => {
                tracing::warn!(
                    reference = %locked.reference,
                    transaction_id = %locked.id,
                    "Payment purpose not recognised; settling without effect"
                );
                Ok(None)
            }
        }
    }

    /// Re-run [`Self::verify_and_apply`] for Pending transactions older than
    /// `older_than`, oldest first. One failure does not stop the sweep.
    pub async fn reconcile_stale_pending(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<StaleSweepReport> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let pending = self.store.pending_transactions_before(cutoff, limit).await?;

        let mut report = StaleSweepReport {
            examined: pending.len(),
            ..StaleSweepReport::default()
        };

        for transaction in pending {
            match self.verify_and_apply(&transaction.reference).await {
                Ok(ReconcileOutcome::Applied { .. }) | Ok(ReconcileOutcome::Ignored) => {
                    report.applied += 1
                }
                Ok(ReconcileOutcome::PaymentFailed) => report.failed += 1,
                Ok(ReconcileOutcome::StillPending) => report.still_pending += 1,
                Ok(ReconcileOutcome::AmountMismatch { .. })
                | Ok(ReconcileOutcome::NeedsReview { .. }) => report.needs_review += 1,
                Ok(ReconcileOutcome::AlreadyProcessed { .. })
                | Ok(ReconcileOutcome::UnknownReference) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        reference = %transaction.reference,
                        error = %e,
                        "Stale transaction reconciliation failed"
                    );
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            applied = report.applied,
            failed = report.failed,
            still_pending = report.still_pending,
            needs_review = report.needs_review,
            errors = report.errors,
            "Stale pending sweep complete"
        );

        Ok(report)
    }
}
