//! Paystack webhook handling
//!
//! The body is only used to learn which reference to reconcile. Status and
//! amount always come from a fresh gateway verify inside
//! [`PaymentReconciler::verify_and_apply`].

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::reconciliation::{PaymentReconciler, ReconcileOutcome};

type HmacSha512 = Hmac<Sha512>;

/// Header carrying the hex HMAC-SHA512 of the raw body
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    data: Option<WebhookData>,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    reference: Option<String>,
}

/// The fields of an event this service acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event: String,
    pub reference: Option<String>,
}

/// Compute the signature Paystack sends for `payload`
pub fn sign_payload(secret: &str, payload: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against the raw body
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> BillingResult<()> {
    let provided = hex::decode(signature.trim()).map_err(|_| BillingError::InvalidSignature)?;

    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(BillingError::InvalidSignature)
    }
}

pub fn parse_event(payload: &[u8]) -> BillingResult<WebhookEvent> {
    let envelope: WebhookEnvelope = serde_json::from_slice(payload)
        .map_err(|e| BillingError::InvalidInput(format!("Malformed webhook body: {}", e)))?;
    Ok(WebhookEvent {
        event: envelope.event,
        reference: envelope
            .data
            .and_then(|d| d.reference)
            .filter(|r| !r.trim().is_empty()),
    })
}

/// Webhook handler for Paystack events
#[derive(Clone)]
pub struct WebhookHandler {
    secret_key: String,
    reconciler: PaymentReconciler,
}

impl WebhookHandler {
    pub fn new(secret_key: impl Into<String>, reconciler: PaymentReconciler) -> Self {
        Self {
            secret_key: secret_key.into(),
            reconciler,
        }
    }

    /// Authenticate, then reconcile the referenced transaction.
    ///
    /// Returns `None` for authenticated events that carry no reference.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<Option<ReconcileOutcome>> {
        if let Err(e) = verify_signature(&self.secret_key, payload, signature) {
            tracing::warn!(payload_len = payload.len(), "Webhook signature rejected");
            return Err(e);
        }

        let event = parse_event(payload)?;
        let Some(reference) = event.reference else {
            tracing::debug!(event = %event.event, "Webhook event without reference ignored");
            return Ok(None);
        };

        tracing::info!(event = %event.event, reference = %reference, "Webhook received");
        self.reconciler.verify_and_apply(&reference).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::PaymentInitiator;
    use crate::store::{BillingStore, MemoryStore};
    use crate::testing::FakeGateway;
    use nitp_shared::{MemberType, MembershipGrade, PaymentPurpose, TransactionStatus};
    use std::sync::Arc;

    const SECRET: &str = "sk_test_webhook";

    #[test]
    fn test_signature_round_trip_and_tamper() {
        let body = br#"{"event":"charge.success","data":{"reference":"NITP-1-000001"}}"#;
        let signature = sign_payload(SECRET, body).unwrap();
        assert_eq!(signature.len(), 128);
        assert!(verify_signature(SECRET, body, &signature).is_ok());

        let tampered = br#"{"event":"charge.success","data":{"reference":"NITP-1-000002"}}"#;
        assert!(matches!(
            verify_signature(SECRET, tampered, &signature),
            Err(BillingError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature("other", body, &signature),
            Err(BillingError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature(SECRET, body, "not-hex"),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_parse_event_reference() {
        let event = parse_event(
            br#"{"event":"charge.success","data":{"reference":"NITP-5-123456","amount":100}}"#,
        )
        .unwrap();
        assert_eq!(event.event, "charge.success");
        assert_eq!(event.reference.as_deref(), Some("NITP-5-123456"));

        let no_data = parse_event(br#"{"event":"subscription.create"}"#).unwrap();
        assert!(no_data.reference.is_none());

        assert!(parse_event(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_forged_body_cannot_settle() {
        let store = MemoryStore::new();
        let gateway = Arc::new(FakeGateway::new());
        let dyn_store: Arc<dyn BillingStore> = Arc::new(store.clone());
        let payments = PaymentInitiator::new(dyn_store.clone(), gateway.clone());
        let handler = WebhookHandler::new(
            SECRET,
            PaymentReconciler::new(dyn_store, gateway.clone(), "https://c.example"),
        );

        let member = store
            .seed_member(MemberType::Individual, MembershipGrade::Student)
            .await;
        let checkout = payments
            .open_checkout(
                member.id,
                "ada@example.com",
                1_000,
                PaymentPurpose::Credits {
                    member_id: member.id,
                    credits: 100,
                },
            )
            .await
            .unwrap();

        // Correctly signed, claims success, but the gateway still says pending
        let body = format!(
            r#"{{"event":"charge.success","data":{{"reference":"{}","status":"success"}}}}"#,
            checkout.reference
        );
        let signature = sign_payload(SECRET, body.as_bytes()).unwrap();
        let outcome = handler.handle(body.as_bytes(), &signature).await.unwrap();
        assert_eq!(outcome, Some(ReconcileOutcome::StillPending));

        // Unsigned: rejected before any lookup
        let err = handler.handle(body.as_bytes(), "00").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));

        let tx = store.get_transaction(&checkout.reference).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(gateway.verify_calls(), 1);
    }
}
