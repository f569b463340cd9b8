//! Payment initiation
//!
//! Every paid action follows the same order: generate a reference, open a
//! checkout with the gateway, then record the Pending transaction. A gateway
//! failure therefore leaves no local row behind.

use std::sync::Arc;

use nitp_shared::PaymentPurpose;
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::{CheckoutRequest, CheckoutSession, PaymentGateway};
use crate::store::{BillingStore, NewTransaction};

/// Fresh transaction reference: `NITP-<unix millis>-<6 random digits>`
///
/// Uniqueness is enforced by the transactions table, not by this function.
pub fn generate_reference() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix: u32 = rand::rng().random_range(0..1_000_000);
    format!("NITP-{}-{:06}", millis, suffix)
}

/// What the client needs to send the payer to checkout
#[derive(Debug, Clone, Serialize)]
pub struct PaymentCheckout {
    pub reference: String,
    pub authorization_url: String,
    pub access_code: String,
    /// Whole Naira
    pub amount: i64,
}

impl PaymentCheckout {
    pub fn from_session(session: CheckoutSession, amount: i64) -> Self {
        Self {
            reference: session.reference,
            authorization_url: session.authorization_url,
            access_code: session.access_code,
            amount,
        }
    }
}

#[derive(Clone)]
pub struct PaymentInitiator {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentInitiator {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Open a gateway checkout. No local state is written.
    pub async fn initiate_payment(
        &self,
        email: &str,
        amount: i64,
        reference: &str,
        purpose: &PaymentPurpose,
    ) -> BillingResult<CheckoutSession> {
        self.gateway
            .initialize(&CheckoutRequest {
                email: email.to_string(),
                amount,
                reference: reference.to_string(),
                metadata: purpose.to_json(),
            })
            .await
    }

    /// Open a checkout and record the Pending transaction for it
    pub async fn open_checkout(
        &self,
        member_id: Uuid,
        email: &str,
        amount: i64,
        purpose: PaymentPurpose,
    ) -> BillingResult<PaymentCheckout> {
        let reference = generate_reference();
        let session = self
            .initiate_payment(email, amount, &reference, &purpose)
            .await?;

        let tx_type = purpose.transaction_type();
        self.store
            .insert_transaction(NewTransaction {
                member_id,
                reference: reference.clone(),
                amount,
                purpose,
            })
            .await?;

        tracing::info!(
            member_id = %member_id,
            reference = %reference,
            tx_type = %tx_type,
            amount = amount,
            "Payment initiated"
        );

        Ok(PaymentCheckout::from_session(session, amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_format() {
        let reference = generate_reference();
        let parts: Vec<&str> = reference.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "NITP");
        assert!(parts[1].parse::<i64>().unwrap() > 1_600_000_000_000);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }
}
