//! Credits ledger
//!
//! Balances change only through single atomic storage operations; there is
//! no read-modify-write of a balance anywhere in this module.

use std::sync::Arc;

use nitp_shared::{PaymentPurpose, Tool, ToolUsage};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payments::{PaymentCheckout, PaymentInitiator};
use crate::store::{BillingStore, DebitOutcome};
use crate::subscriptions::SubscriptionLedger;

/// Naira per credit
pub const NAIRA_PER_CREDIT: i64 = 10;

/// Smallest credit purchase in Naira
pub const MIN_CREDIT_PURCHASE: i64 = 1_000;

/// Floor division; a partial credit is never granted
pub fn naira_to_credits(naira: i64) -> i64 {
    naira.div_euclid(NAIRA_PER_CREDIT)
}

pub fn credits_to_naira(credits: i64) -> i64 {
    credits * NAIRA_PER_CREDIT
}

/// A completed tool debit
#[derive(Debug, Clone, Serialize)]
pub struct ToolUseReceipt {
    pub usage: ToolUsage,
    pub balance: i64,
}

#[derive(Clone)]
pub struct CreditsLedger {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionLedger,
    payments: PaymentInitiator,
}

impl CreditsLedger {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionLedger,
        payments: PaymentInitiator,
    ) -> Self {
        Self {
            store,
            subscriptions,
            payments,
        }
    }

    pub async fn balance(&self, member_id: Uuid) -> BillingResult<i64> {
        self.store
            .get_member(member_id)
            .await?
            .map(|m| m.credits)
            .ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))
    }

    pub async fn list_tools(&self) -> BillingResult<Vec<Tool>> {
        self.store.list_tools().await
    }

    /// Atomic increment, returns the new balance
    pub async fn add_credits(&self, member_id: Uuid, amount: i64) -> BillingResult<i64> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "Credit amount must be positive".to_string(),
            ));
        }
        let balance = self.store.increment_credits(member_id, amount).await?;
        tracing::info!(member_id = %member_id, amount = amount, balance = balance, "Credits added");
        Ok(balance)
    }

    /// Atomic check-and-decrement with a usage record
    pub async fn debit_credits(
        &self,
        member_id: Uuid,
        tool_id: Uuid,
        cost: i64,
    ) -> BillingResult<ToolUseReceipt> {
        if cost <= 0 {
            return Err(BillingError::InvalidInput(
                "Credit cost must be positive".to_string(),
            ));
        }

        match self.store.debit_credits(member_id, tool_id, cost).await? {
            DebitOutcome::Debited { usage, balance } => {
                tracing::info!(
                    member_id = %member_id,
                    tool_id = %tool_id,
                    cost = cost,
                    balance = balance,
                    "Credits debited"
                );
                Ok(ToolUseReceipt { usage, balance })
            }
            DebitOutcome::Insufficient { balance } => {
                tracing::debug!(
                    member_id = %member_id,
                    balance = balance,
                    required = cost,
                    "Debit refused"
                );
                Err(BillingError::InsufficientCredits {
                    balance,
                    required: cost,
                })
            }
        }
    }

    /// Charge the tool's cost. Requires an active subscription.
    pub async fn use_tool(&self, member_id: Uuid, tool_id: Uuid) -> BillingResult<ToolUseReceipt> {
        self.subscriptions.require_active(member_id).await?;

        let tool = self
            .store
            .get_tool(tool_id)
            .await?
            .filter(|t| t.is_active)
            .ok_or_else(|| BillingError::NotFound(format!("Tool {}", tool_id)))?;

        self.debit_credits(member_id, tool.id, tool.credit_cost).await
    }

    /// Checkout for buying credits with `amount_naira`. Requires an active
    /// subscription.
    pub async fn start_purchase(
        &self,
        member_id: Uuid,
        email: &str,
        amount_naira: i64,
    ) -> BillingResult<PaymentCheckout> {
        self.subscriptions.require_active(member_id).await?;

        if amount_naira < MIN_CREDIT_PURCHASE {
            return Err(BillingError::InvalidInput(format!(
                "Minimum credit purchase is {} Naira",
                MIN_CREDIT_PURCHASE
            )));
        }
        if amount_naira % NAIRA_PER_CREDIT != 0 {
            return Err(BillingError::InvalidInput(format!(
                "Amount must be a multiple of {} Naira",
                NAIRA_PER_CREDIT
            )));
        }

        let credits = naira_to_credits(amount_naira);
        self.payments
            .open_checkout(
                member_id,
                email,
                amount_naira,
                PaymentPurpose::Credits { member_id, credits },
            )
            .await
    }
}
