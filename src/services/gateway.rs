//! Payment gateway boundary.
//!
//! `PaymentGateway` is the protocol the reconciler and the refund processor
//! speak; `PayPalGateway` implements it over the PayPal Orders v2 and
//! Payments v2 REST APIs. The adapter does no deduplication of its own:
//! callers check local state first and pass idempotency keys where the
//! provider supports them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    future::Future,
    str::FromStr,
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError},
    config::PayPalConfig,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No answer within the deadline; the provider may or may not have acted.
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("unexpected gateway response: {0}")]
    Decode(String),
    /// The provider answered but refused the operation (declined, voided, failed refund).
    #[error("gateway rejected the operation: {0}")]
    Rejected(String),
    #[error("gateway circuit is open")]
    CircuitOpen,
}

impl GatewayError {
    /// The call may have taken effect at the provider.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Transport(_))
    }

    fn trips_breaker(&self) -> bool {
        match self {
            GatewayError::Timeout | GatewayError::Transport(_) => true,
            GatewayError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteOrderStatus {
    Created,
    Saved,
    Approved,
    Voided,
    Completed,
    PayerActionRequired,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureStatus {
    Completed,
    Declined,
    PartiallyRefunded,
    Pending,
    Refunded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteRefundStatus {
    Cancelled,
    Failed,
    Pending,
    Completed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrder {
    pub gateway_order_id: String,
    pub approve_url: String,
}

/// Authoritative view of a gateway order, from a capture or a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOrderState {
    pub status: RemoteOrderStatus,
    pub capture_id: Option<String>,
    pub capture_status: Option<CaptureStatus>,
    pub captured_amount: Option<Decimal>,
}

impl GatewayOrderState {
    /// Money has been collected for this order.
    pub fn is_paid(&self) -> bool {
        self.status == RemoteOrderStatus::Completed
            && self.capture_id.is_some()
            && matches!(
                self.capture_status,
                Some(CaptureStatus::Completed)
                    | Some(CaptureStatus::PartiallyRefunded)
                    | Some(CaptureStatus::Refunded)
            )
    }

    /// The order can no longer be paid.
    pub fn is_failed(&self) -> bool {
        self.status == RemoteOrderStatus::Voided
            || matches!(
                self.capture_status,
                Some(CaptureStatus::Declined) | Some(CaptureStatus::Failed)
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundResult {
    pub refund_id: String,
    pub status: RemoteRefundStatus,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a gateway order the buyer approves at `approve_url`.
    async fn create_remote_order(
        &self,
        amount: Decimal,
        currency: &str,
        reference_id: &str,
    ) -> Result<RemoteOrder, GatewayError>;

    /// Captures an approved order.
    async fn capture(&self, gateway_order_id: &str) -> Result<GatewayOrderState, GatewayError>;

    /// Reads the current state of an order without changing it.
    async fn fetch_order(&self, gateway_order_id: &str)
        -> Result<GatewayOrderState, GatewayError>;

    /// Refunds part or all of a capture. Repeating a call with the same
    /// `idempotency_key` returns the original refund instead of issuing another.
    async fn refund(
        &self,
        capture_id: &str,
        amount: Decimal,
        currency: &str,
        note: &str,
        idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError>;

    /// Reads the current state of a refund issued earlier.
    async fn fetch_refund(&self, refund_id: &str) -> Result<RefundResult, GatewayError>;
}

/// Formats money the way PayPal expects it: two decimals, no exponent.
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

// Wire formats

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct Money {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: CaptureStatus,
    amount: Option<Money>,
}

#[derive(Debug, Default, Deserialize)]
struct UnitPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<UnitPayments>,
}

#[derive(Debug, Deserialize)]
struct OrderBody {
    id: String,
    status: RemoteOrderStatus,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct RefundBody {
    id: String,
    status: RemoteRefundStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    issue: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
    // OAuth errors use a different shape
    error: Option<String>,
    error_description: Option<String>,
}

fn provider_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => {
            let mut parts = Vec::new();
            if let Some(name) = err.name.or(err.error) {
                parts.push(name);
            }
            if let Some(message) = err.message.or(err.error_description) {
                parts.push(message);
            }
            for detail in err.details {
                match (detail.issue, detail.description) {
                    (Some(issue), Some(desc)) => parts.push(format!("{} ({})", issue, desc)),
                    (Some(issue), None) => parts.push(issue),
                    (None, Some(desc)) => parts.push(desc),
                    (None, None) => {}
                }
            }
            if parts.is_empty() {
                body.to_string()
            } else {
                parts.join(": ")
            }
        }
        Err(_) => body.chars().take(512).collect(),
    }
}

fn order_state(body: OrderBody) -> Result<GatewayOrderState, GatewayError> {
    let capture = body
        .purchase_units
        .into_iter()
        .filter_map(|unit| unit.payments)
        .flat_map(|payments| payments.captures)
        .next();

    let (capture_id, capture_status, captured_amount) = match capture {
        Some(c) => {
            let amount = match c.amount {
                Some(money) => Some(Decimal::from_str(&money.value).map_err(|e| {
                    GatewayError::Decode(format!("capture amount '{}': {}", money.value, e))
                })?),
                None => None,
            };
            (Some(c.id), Some(c.status), amount)
        }
        None => (None, None, None),
    };

    Ok(GatewayOrderState {
        status: body.status,
        capture_id,
        capture_status,
        captured_amount,
    })
}

fn approve_url(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel == "approve" || l.rel == "payer-action")
        .map(|l| l.href.clone())
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// PayPal REST client.
pub struct PayPalGateway {
    client: reqwest::Client,
    config: PayPalConfig,
    token: Mutex<Option<CachedToken>>,
    breaker: CircuitBreaker,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Transport(format!("http client: {}", e)))?;

        let breaker = CircuitBreaker::new(
            "paypal",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
                success_threshold: 1,
            },
        );

        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
            breaker,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn cached_token(&self) -> Option<String> {
        let guard = match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .filter(|t| t.expires_at > Instant::now())
            .map(|t| t.value.clone())
    }

    fn store_token(&self, token: CachedToken) {
        let mut guard = match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(token);
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = Self::decode(response).await?;

        // refresh a minute early so a token never expires mid-request
        let ttl = Duration::from_secs(token.expires_in.saturating_sub(60).max(1));
        self.store_token(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        debug!("paypal access token refreshed");
        Ok(token.access_token)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Provider {
                status: status.as_u16(),
                message: provider_message(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn guarded<T, F, Fut>(&self, call: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match self.breaker.call(GatewayError::trips_breaker, call).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen) => {
                warn!("paypal circuit open, call not attempted");
                Err(GatewayError::CircuitOpen)
            }
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    #[instrument(skip(self), fields(amount = %amount))]
    async fn create_remote_order(
        &self,
        amount: Decimal,
        currency: &str,
        reference_id: &str,
    ) -> Result<RemoteOrder, GatewayError> {
        self.guarded(move || async move {
            let token = self.access_token().await?;
            let body = json!({
                "intent": "CAPTURE",
                "purchase_units": [{
                    "reference_id": reference_id,
                    "amount": {
                        "currency_code": currency,
                        "value": format_amount(amount),
                    },
                }],
                "application_context": {
                    "return_url": self.config.return_url,
                    "cancel_url": self.config.cancel_url,
                    "user_action": "PAY_NOW",
                },
            });

            let response = self
                .client
                .post(self.url("/v2/checkout/orders"))
                .bearer_auth(token)
                .json(&body)
                .send()
                .await?;
            let order: OrderBody = Self::decode(response).await?;

            let approve_url = approve_url(&order.links).ok_or_else(|| {
                GatewayError::Decode(format!("order {} has no approve link", order.id))
            })?;
            Ok(RemoteOrder {
                gateway_order_id: order.id,
                approve_url,
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn capture(&self, gateway_order_id: &str) -> Result<GatewayOrderState, GatewayError> {
        self.guarded(move || async move {
            let token = self.access_token().await?;
            let response = self
                .client
                .post(self.url(&format!("/v2/checkout/orders/{}/capture", gateway_order_id)))
                .bearer_auth(token)
                .header("PayPal-Request-Id", format!("capture-{}", gateway_order_id))
                .header("Prefer", "return=representation")
                .json(&json!({}))
                .send()
                .await?;
            order_state(Self::decode(response).await?)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn fetch_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<GatewayOrderState, GatewayError> {
        self.guarded(move || async move {
            let token = self.access_token().await?;
            let response = self
                .client
                .get(self.url(&format!("/v2/checkout/orders/{}", gateway_order_id)))
                .bearer_auth(token)
                .send()
                .await?;
            order_state(Self::decode(response).await?)
        })
        .await
    }

    #[instrument(skip(self, note), fields(amount = %amount))]
    async fn refund(
        &self,
        capture_id: &str,
        amount: Decimal,
        currency: &str,
        note: &str,
        idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError> {
        self.guarded(move || async move {
            let token = self.access_token().await?;
            let body = json!({
                "amount": {
                    "value": format_amount(amount),
                    "currency_code": currency,
                },
                "note_to_payer": note,
            });
            let response = self
                .client
                .post(self.url(&format!("/v2/payments/captures/{}/refund", capture_id)))
                .bearer_auth(token)
                .header("PayPal-Request-Id", idempotency_key)
                .header("Prefer", "return=representation")
                .json(&body)
                .send()
                .await?;
            let refund: RefundBody = Self::decode(response).await?;
            Ok(RefundResult {
                refund_id: refund.id,
                status: refund.status,
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn fetch_refund(&self, refund_id: &str) -> Result<RefundResult, GatewayError> {
        self.guarded(move || async move {
            let token = self.access_token().await?;
            let response = self
                .client
                .get(self.url(&format!("/v2/payments/refunds/{}", refund_id)))
                .bearer_auth(token)
                .send()
                .await?;
            let refund: RefundBody = Self::decode(response).await?;
            Ok(RefundResult {
                refund_id: refund.id,
                status: refund.status,
            })
        })
        .await
    }
}
