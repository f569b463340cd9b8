//! Subscription ledger
//!
//! A subscription is an immutable paid period `[start_date, end_date)`.
//! Periods are only created by payment settlement, and a renewal starts
//! where the latest period ends, so periods of one member never overlap.

use std::sync::Arc;

use nitp_shared::{MemberStatus, MembershipGrade, PaymentPurpose, Subscription};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fees::subscription_fee;
use crate::payments::{PaymentCheckout, PaymentInitiator};
use crate::store::{BillingStore, LedgerTx, NewSubscription};

/// Length of one membership period
pub const SUBSCRIPTION_PERIOD_DAYS: i64 = 365;

/// Insert the period funded by `funding_tx_id` inside the caller's unit of
/// work. Starts at `now`, or at the end of the latest period if that is later.
pub async fn create_subscription(
    tx: &mut dyn LedgerTx,
    member_id: Uuid,
    grade: MembershipGrade,
    amount: i64,
    funding_tx_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    let start_date = match tx.latest_period_end(member_id).await? {
        Some(latest_end) if latest_end > now => latest_end,
        _ => now,
    };
    let end_date = start_date + Duration::days(SUBSCRIPTION_PERIOD_DAYS);

    let subscription = tx
        .insert_subscription(NewSubscription {
            member_id,
            grade,
            amount,
            start_date,
            end_date,
            transaction_id: funding_tx_id,
        })
        .await?;

    tracing::info!(
        member_id = %member_id,
        grade = %grade,
        start_date = %start_date,
        end_date = %end_date,
        "Subscription period created"
    );

    Ok(subscription)
}

#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn BillingStore>,
    payments: PaymentInitiator,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn BillingStore>, payments: PaymentInitiator) -> Self {
        Self { store, payments }
    }

    /// The period containing the current instant, if any
    pub async fn get_active_subscription(
        &self,
        member_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.store
            .subscription_covering(member_id, OffsetDateTime::now_utc())
            .await
    }

    /// Gate for subscription-only actions
    pub async fn require_active(&self, member_id: Uuid) -> BillingResult<Subscription> {
        match self.get_active_subscription(member_id).await? {
            Some(subscription) => Ok(subscription),
            None => {
                tracing::debug!(member_id = %member_id, "Subscription gate denied");
                Err(BillingError::SubscriptionRequired)
            }
        }
    }

    /// All periods, newest first
    pub async fn history(&self, member_id: Uuid) -> BillingResult<Vec<Subscription>> {
        self.store.list_subscriptions(member_id).await
    }

    /// Open a checkout for one more period at the member's current grade.
    /// Renewal is allowed without an active subscription.
    pub async fn start_renewal(
        &self,
        member_id: Uuid,
        email: &str,
    ) -> BillingResult<PaymentCheckout> {
        let member = self
            .store
            .get_member(member_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))?;

        if member.status == MemberStatus::Suspended {
            return Err(BillingError::Forbidden(
                "Membership is suspended".to_string(),
            ));
        }

        let amount = subscription_fee(member.grade);
        self.payments
            .open_checkout(
                member_id,
                email,
                amount,
                PaymentPurpose::Subscription {
                    member_id,
                    grade: member.grade,
                },
            )
            .await
    }
}
