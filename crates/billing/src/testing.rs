//! Scripted payment gateway for tests and local runs without gateway keys

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    naira_to_kobo, CheckoutRequest, CheckoutSession, GatewayStatus, PaymentGateway,
    VerifiedPayment,
};

#[derive(Debug, Clone)]
struct Scripted {
    status: GatewayStatus,
    amount_minor: Option<i64>,
    reference: Option<String>,
}

/// In-process [`PaymentGateway`]
///
/// Every initialized checkout verifies as `Pending` until a test scripts an
/// outcome with [`FakeGateway::settle`].
#[derive(Default)]
pub struct FakeGateway {
    checkouts: Mutex<HashMap<String, CheckoutRequest>>,
    outcomes: Mutex<HashMap<String, Scripted>>,
    verify_calls: AtomicUsize,
    fail_initialize: AtomicBool,
    unavailable: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `status` for `reference` with the amount that was initialized
    pub async fn settle(&self, reference: &str, status: GatewayStatus) {
        self.outcomes.lock().await.insert(
            reference.to_string(),
            Scripted {
                status,
                amount_minor: None,
                reference: None,
            },
        );
    }

    /// Report success with a different amount than was initialized
    pub async fn settle_with_amount(&self, reference: &str, amount_minor: i64) {
        self.outcomes.lock().await.insert(
            reference.to_string(),
            Scripted {
                status: GatewayStatus::Success,
                amount_minor: Some(amount_minor),
                reference: None,
            },
        );
    }

    /// Report success for a different reference than the one asked about
    pub async fn settle_with_reference(&self, reference: &str, reported: &str) {
        self.outcomes.lock().await.insert(
            reference.to_string(),
            Scripted {
                status: GatewayStatus::Success,
                amount_minor: None,
                reference: Some(reported.to_string()),
            },
        );
    }

    /// Reject every following `initialize`
    pub fn reject_initialize(&self, reject: bool) {
        self.fail_initialize.store(reject, Ordering::SeqCst);
    }

    /// Make every following call fail as unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub async fn checkout(&self, reference: &str) -> Option<CheckoutRequest> {
        self.checkouts.lock().await.get(reference).cloned()
    }

    pub async fn checkout_count(&self) -> usize {
        self.checkouts.lock().await.len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn initialize(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::GatewayUnavailable("connection refused".to_string()));
        }
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(BillingError::Gateway("Invalid email address".to_string()));
        }

        self.checkouts
            .lock()
            .await
            .insert(request.reference.clone(), request.clone());

        Ok(CheckoutSession {
            authorization_url: format!("https://checkout.test/{}", request.reference),
            access_code: format!("ac_{}", request.reference),
            reference: request.reference.clone(),
        })
    }

    async fn verify(&self, reference: &str) -> BillingResult<VerifiedPayment> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::GatewayUnavailable("connection refused".to_string()));
        }

        let checkout = self.checkouts.lock().await.get(reference).cloned();
        let scripted = self.outcomes.lock().await.get(reference).cloned();

        let (status, amount_override, reported_reference) = match scripted {
            Some(s) => (s.status, s.amount_minor, s.reference),
            None => (GatewayStatus::Pending, None, None),
        };
        let amount_minor = match (amount_override, &checkout) {
            (Some(amount), _) => amount,
            (None, Some(c)) => naira_to_kobo(c.amount)?,
            (None, None) => 0,
        };
        let reported_reference = reported_reference.unwrap_or_else(|| reference.to_string());
        let metadata = checkout
            .as_ref()
            .map(|c| c.metadata.clone())
            .unwrap_or(serde_json::Value::Null);

        Ok(VerifiedPayment {
            status,
            reference: reported_reference.clone(),
            amount_minor,
            metadata: metadata.clone(),
            customer_email: checkout.map(|c| c.email),
            raw: serde_json::json!({
                "reference": reported_reference,
                "amount": amount_minor,
                "status": format!("{:?}", status).to_lowercase(),
                "metadata": metadata,
            }),
        })
    }
}
