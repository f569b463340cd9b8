// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NITP Billing Module
//!
//! Membership subscriptions, application fees, tool credits and payment
//! reconciliation against Paystack.
//!
//! ## Features
//!
//! - **Subscriptions**: Annual paid periods gating member-only actions
//! - **Applications**: SAR / EIAR workflow with fee schedule and certificates
//! - **Credits**: Prepaid balance consumed by planning tools
//! - **Reconciliation**: Idempotent verify-and-apply for every payment
//! - **Webhooks**: Signed Paystack callbacks
//! - **Invariants**: Read-only consistency checks

pub mod applications;
pub mod credits;
pub mod error;
pub mod fees;
pub mod gateway;
pub mod invariants;
pub mod members;
pub mod payments;
pub mod reconciliation;
pub mod store;
pub mod subscriptions;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod webhooks;


use std::sync::Arc;

// Applications
pub use applications::{format_certificate_number, ApplicationWorkflow, CreateApplication};

// Credits
pub use credits::{
    credits_to_naira, naira_to_credits, CreditsLedger, ToolUseReceipt, MIN_CREDIT_PURCHASE,
    NAIRA_PER_CREDIT,
};

// Error
pub use error::{BillingError, BillingResult};

// Fees
pub use fees::{subscription_fee, ApplicationFee, FeeEntry, FeeSchedule, APPLICATION_ADMIN_FEE};

// Gateway
pub use gateway::{
    CheckoutRequest, CheckoutSession, GatewayConfig, GatewayStatus, PaymentGateway,
    PaystackClient, VerifiedPayment,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Members
pub use members::MemberService;

// Payments
pub use payments::{generate_reference, PaymentCheckout, PaymentInitiator};

// Reconciliation
pub use reconciliation::{AppliedEffect, PaymentReconciler, ReconcileOutcome, StaleSweepReport};

// Store
pub use store::{BillingStore, LedgerTx, MemoryStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{SubscriptionLedger, SUBSCRIPTION_PERIOD_DAYS};

// Webhooks
pub use webhooks::{WebhookHandler, SIGNATURE_HEADER};

use sqlx::PgPool;

const DEFAULT_CERTIFICATE_BASE_URL: &str = "https://portal.nitp.org.ng/certificates";

/// Settings shared by the billing services
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Paystack secret key; also signs webhooks
    pub webhook_secret: String,
    pub certificate_base_url: String,
    pub fees: FeeSchedule,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("PAYSTACK_SECRET_KEY")
            .map_err(|_| BillingError::Config("PAYSTACK_SECRET_KEY not set".to_string()))?;
        let certificate_base_url = std::env::var("CERTIFICATE_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_CERTIFICATE_BASE_URL.to_string());

        Ok(Self {
            webhook_secret,
            certificate_base_url,
            fees: FeeSchedule::standard(),
        })
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub members: MemberService,
    pub subscriptions: SubscriptionLedger,
    pub credits: CreditsLedger,
    pub applications: ApplicationWorkflow,
    pub payments: PaymentInitiator,
    pub reconciler: PaymentReconciler,
    pub webhooks: WebhookHandler,
    store: Arc<dyn BillingStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = PaystackClient::from_env()?;
        let config = BillingConfig::from_env()?;
        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(gateway),
            config,
        ))
    }

    /// Create a new billing service with explicit storage, gateway and config
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: BillingConfig,
    ) -> Self {
        let payments = PaymentInitiator::new(store.clone(), gateway.clone());
        let subscriptions = SubscriptionLedger::new(store.clone(), payments.clone());
        let reconciler =
            PaymentReconciler::new(store.clone(), gateway, config.certificate_base_url.clone());

        Self {
            members: MemberService::new(store.clone()),
            credits: CreditsLedger::new(store.clone(), subscriptions.clone(), payments.clone()),
            applications: ApplicationWorkflow::new(
                store.clone(),
                subscriptions.clone(),
                payments.clone(),
                config.fees,
            ),
            webhooks: WebhookHandler::new(config.webhook_secret, reconciler.clone()),
            subscriptions,
            payments,
            reconciler,
            store,
        }
    }

    /// Look up a transaction by reference
    pub async fn transaction(
        &self,
        reference: &str,
    ) -> BillingResult<Option<nitp_shared::Transaction>> {
        self.store.get_transaction(reference).await
    }
}
