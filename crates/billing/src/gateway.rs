//! Payment gateway client
//!
//! [`PaymentGateway`] is the seam the rest of the crate talks to;
//! [`PaystackClient`] is the production implementation. Amounts cross this
//! boundary in kobo and are whole Naira everywhere else.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const DEFAULT_BASE_URL: &str = "https://api.paystack.co";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_RETRIES: usize = 3;

/// Convert whole Naira to kobo
pub fn naira_to_kobo(naira: i64) -> BillingResult<i64> {
    naira
        .checked_mul(100)
        .ok_or_else(|| BillingError::InvalidInput(format!("Amount out of range: {}", naira)))
}

/// Gateway connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub secret_key: String,
    pub base_url: String,
    pub callback_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Retries after the first attempt, transient failures only
    pub max_retries: usize,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("PAYSTACK_SECRET_KEY")
            .map_err(|_| BillingError::Config("PAYSTACK_SECRET_KEY not set".to_string()))?;
        let callback_url = std::env::var("PAYMENT_CALLBACK_URL")
            .map_err(|_| BillingError::Config("PAYMENT_CALLBACK_URL not set".to_string()))?;
        let base_url =
            std::env::var("PAYSTACK_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let timeout_secs = match std::env::var("GATEWAY_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::Config(format!("GATEWAY_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            secret_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            callback_url,
            timeout: Duration::from_secs(timeout_secs),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }
}

/// What to charge for
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub email: String,
    /// Whole Naira
    pub amount: i64,
    pub reference: String,
    pub metadata: serde_json::Value,
}

/// Hosted checkout returned by `initialize`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

/// Payment status as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Success,
    Failed,
    Abandoned,
    /// Anything not yet final: ongoing, pending, processing, queued
    Pending,
}

impl GatewayStatus {
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "success" => GatewayStatus::Success,
            "failed" | "reversed" => GatewayStatus::Failed,
            "abandoned" => GatewayStatus::Abandoned,
            _ => GatewayStatus::Pending,
        }
    }
}

/// Result of `verify`
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub status: GatewayStatus,
    pub reference: String,
    pub amount_minor: i64,
    pub metadata: serde_json::Value,
    pub customer_email: Option<String>,
    /// Full verify payload, kept on the transaction for audit
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession>;
    async fn verify(&self, reference: &str) -> BillingResult<VerifiedPayment>;
}

// =============================================================================
// Paystack
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    amount: i64,
    reference: &'a str,
    callback_url: &'a str,
    metadata: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    reference: String,
    amount: i64,
    #[serde(default)]
    metadata: serde_json::Value,
    customer: Option<VerifyCustomer>,
}

#[derive(Debug, Deserialize)]
struct VerifyCustomer {
    email: Option<String>,
}

/// Paystack REST client
#[derive(Clone)]
pub struct PaystackClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl PaystackClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries)
    }

    /// `{base_url}/transaction/verify/{reference}` with the reference escaped
    /// as a single path segment
    fn verify_url(&self, reference: &str) -> BillingResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.config.base_url).map_err(|e| {
            BillingError::Config(format!("Invalid PAYSTACK_BASE_URL {}: {}", self.config.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                BillingError::Config(format!(
                    "PAYSTACK_BASE_URL cannot carry a path: {}",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["transaction", "verify", reference]);
        Ok(url)
    }

    /// Decode a Paystack response; 5xx and 429 are transient, other 4xx
    /// carry the gateway's own message
    async fn read_envelope<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> BillingResult<(T, serde_json::Value)> {
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BillingError::GatewayUnavailable(format!(
                "Gateway returned {}",
                status
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Unreadable gateway response: {}", e)))?;
        let envelope: Envelope<T> = serde_json::from_value(body.clone())
            .map_err(|e| BillingError::Gateway(format!("Unexpected gateway response: {}", e)))?;

        if !status.is_success() || !envelope.status {
            return Err(BillingError::Gateway(envelope.message));
        }

        let data = envelope
            .data
            .ok_or_else(|| BillingError::Gateway("Gateway response has no data".to_string()))?;
        let raw = body.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Ok((data, raw))
    }

    async fn initialize_once(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        let body = InitializeBody {
            email: &request.email,
            amount: naira_to_kobo(request.amount)?,
            reference: &request.reference,
            callback_url: &self.config.callback_url,
            metadata: &request.metadata,
        };

        let response = self
            .http
            .post(format!("{}/transaction/initialize", self.config.base_url))
            .bearer_auth(&self.config.secret_key)
            .json(&body)
            .send()
            .await?;

        let (session, _) = Self::read_envelope::<CheckoutSession>(response).await?;
        Ok(session)
    }

    async fn verify_once(&self, reference: &str) -> BillingResult<VerifiedPayment> {
        let response = self
            .http
            .get(self.verify_url(reference)?)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        let (data, raw) = Self::read_envelope::<VerifyData>(response).await?;
        Ok(VerifiedPayment {
            status: GatewayStatus::from_gateway(&data.status),
            reference: data.reference,
            amount_minor: data.amount,
            metadata: data.metadata,
            customer_email: data.customer.and_then(|c| c.email),
            raw,
        })
    }
}

#[async_trait]
impl PaymentGateway for PaystackClient {
    async fn initialize(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        let session = RetryIf::spawn(
            self.retry_strategy(),
            || self.initialize_once(request),
            |e: &BillingError| e.is_transient(),
        )
        .await?;

        tracing::info!(
            reference = %session.reference,
            amount = request.amount,
            "Gateway checkout initialized"
        );
        Ok(session)
    }

    async fn verify(&self, reference: &str) -> BillingResult<VerifiedPayment> {
        let payment = RetryIf::spawn(
            self.retry_strategy(),
            || self.verify_once(reference),
            |e: &BillingError| e.is_transient(),
        )
        .await?;

        tracing::debug!(
            reference = %reference,
            status = ?payment.status,
            amount_minor = payment.amount_minor,
            "Gateway verify"
        );
        Ok(payment)
    }
}
