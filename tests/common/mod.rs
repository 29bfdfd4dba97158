#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use orderpay_api::{
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    entities::{cart_item, order, payment, product, user},
    errors::ServiceError,
    events::{self, EventSender},
    services::{
        collaborators::{DbUserLookup, Notifier, OtpDelivery, UserContact, UserLookup},
        gateway::{
            CaptureStatus, GatewayError, GatewayOrderState, PaymentGateway, RefundResult,
            RemoteOrder, RemoteOrderStatus, RemoteRefundStatus,
        },
        AppServices,
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str =
    "orderpay_test_secret_key_that_is_comfortably_longer_than_sixty_four_characters";
pub const TEST_OTP_SECRET: &str = "orderpay_test_otp_secret_32_chars_min";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process stand-in for PayPal. Keeps per-order state so a lookup after a
/// capture sees the capture, and honours refund idempotency keys.
#[derive(Default)]
pub struct FakeGateway {
    pub creates: AtomicUsize,
    pub captures: AtomicUsize,
    pub fetches: AtomicUsize,
    pub refunds: AtomicUsize,
    amounts: Mutex<HashMap<String, Decimal>>,
    settled: Mutex<HashMap<String, GatewayOrderState>>,
    capture_script: Mutex<VecDeque<Result<GatewayOrderState, GatewayError>>>,
    refund_script: Mutex<VecDeque<Result<RefundResult, GatewayError>>>,
    refunds_by_key: Mutex<HashMap<String, RefundResult>>,
    /// Current provider-side state per refund id
    refund_states: Mutex<HashMap<String, RemoteRefundStatus>>,
    /// Captures succeed at the provider but the answer is lost
    lose_capture_responses: Mutex<bool>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues the result of the next `capture` call.
    pub fn script_capture(&self, result: Result<GatewayOrderState, GatewayError>) {
        lock(&self.capture_script).push_back(result);
    }

    /// Queues the result of the next `refund` call.
    pub fn script_refund(&self, result: Result<RefundResult, GatewayError>) {
        lock(&self.refund_script).push_back(result);
    }

    /// Captures take effect but the caller only sees a timeout.
    pub fn lose_capture_responses(&self) {
        *lock(&self.lose_capture_responses) = true;
    }

    /// Marks an order as paid at the provider without a capture call from us,
    /// as when the buyer's capture happened through another channel.
    pub fn settle_remotely(&self, gateway_order_id: &str) {
        let state = self.completed_state(gateway_order_id);
        lock(&self.settled).insert(gateway_order_id.to_string(), state);
    }

    /// Moves a refund the provider is still settling to its final state.
    pub fn settle_refund(&self, refund_id: &str, status: RemoteRefundStatus) {
        lock(&self.refund_states).insert(refund_id.to_string(), status);
    }

    pub fn refund_keys(&self) -> Vec<String> {
        lock(&self.refunds_by_key).keys().cloned().collect()
    }

    fn completed_state(&self, gateway_order_id: &str) -> GatewayOrderState {
        let amount = lock(&self.amounts).get(gateway_order_id).copied();
        GatewayOrderState {
            status: RemoteOrderStatus::Completed,
            capture_id: Some(format!("CAP-{}", gateway_order_id)),
            capture_status: Some(CaptureStatus::Completed),
            captured_amount: amount,
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_remote_order(
        &self,
        amount: Decimal,
        _currency: &str,
        _reference_id: &str,
    ) -> Result<RemoteOrder, GatewayError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let gateway_order_id = format!("GW-{}-{}", n, Uuid::new_v4().simple());
        lock(&self.amounts).insert(gateway_order_id.clone(), amount);
        Ok(RemoteOrder {
            approve_url: format!("https://paypal.test/checkoutnow?token={}", gateway_order_id),
            gateway_order_id,
        })
    }

    async fn capture(&self, gateway_order_id: &str) -> Result<GatewayOrderState, GatewayError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let scripted = lock(&self.capture_script).pop_front();
        if let Some(result) = scripted {
            if let Ok(state) = &result {
                if state.is_paid() {
                    lock(&self.settled).insert(gateway_order_id.to_string(), state.clone());
                }
            }
            return result;
        }

        // PayPal answers a repeated capture with ORDER_ALREADY_CAPTURED
        if lock(&self.settled).contains_key(gateway_order_id) {
            return Err(GatewayError::Provider {
                status: 422,
                message: "UNPROCESSABLE_ENTITY: ORDER_ALREADY_CAPTURED".to_string(),
            });
        }

        let state = self.completed_state(gateway_order_id);
        lock(&self.settled).insert(gateway_order_id.to_string(), state.clone());
        if *lock(&self.lose_capture_responses) {
            return Err(GatewayError::Timeout);
        }
        Ok(state)
    }

    async fn fetch_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<GatewayOrderState, GatewayError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = lock(&self.settled).get(gateway_order_id) {
            return Ok(state.clone());
        }
        if lock(&self.amounts).contains_key(gateway_order_id) {
            return Ok(GatewayOrderState {
                status: RemoteOrderStatus::Approved,
                capture_id: None,
                capture_status: None,
                captured_amount: None,
            });
        }
        Err(GatewayError::Provider {
            status: 404,
            message: "RESOURCE_NOT_FOUND".to_string(),
        })
    }

    async fn refund(
        &self,
        capture_id: &str,
        _amount: Decimal,
        _currency: &str,
        _note: &str,
        idempotency_key: &str,
    ) -> Result<RefundResult, GatewayError> {
        self.refunds.fetch_add(1, Ordering::SeqCst);
        if let Some(existing) = lock(&self.refunds_by_key).get(idempotency_key) {
            return Ok(existing.clone());
        }

        let scripted = lock(&self.refund_script).pop_front();
        let result = scripted.unwrap_or_else(|| {
            Ok(RefundResult {
                refund_id: format!("RF-{}-{}", capture_id, idempotency_key),
                status: RemoteRefundStatus::Completed,
            })
        });
        if let Ok(refund) = &result {
            lock(&self.refunds_by_key).insert(idempotency_key.to_string(), refund.clone());
            lock(&self.refund_states).insert(refund.refund_id.clone(), refund.status);
        }
        result
    }

    async fn fetch_refund(&self, refund_id: &str) -> Result<RefundResult, GatewayError> {
        match lock(&self.refund_states).get(refund_id) {
            Some(status) => Ok(RefundResult {
                refund_id: refund_id.to_string(),
                status: *status,
            }),
            None => Err(GatewayError::Provider {
                status: 404,
                message: "RESOURCE_NOT_FOUND".to_string(),
            }),
        }
    }
}

/// Notifier that remembers what it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    invoices: Mutex<Vec<Uuid>>,
    otps: Mutex<Vec<OtpDelivery>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Payment ids an invoice was sent for, in order.
    pub fn invoices(&self) -> Vec<Uuid> {
        lock(&self.invoices).clone()
    }

    pub fn last_otp_code(&self) -> Option<String> {
        lock(&self.otps)
            .last()
            .map(|delivery| delivery.code.expose().to_string())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_invoice(
        &self,
        payment: &payment::Model,
        _order: &order::Model,
        _user: &UserContact,
    ) -> Result<(), ServiceError> {
        lock(&self.invoices).push(payment.id);
        Ok(())
    }

    async fn send_otp(&self, delivery: &OtpDelivery) -> Result<(), ServiceError> {
        lock(&self.otps).push(delivery.clone());
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        TEST_JWT_SECRET.to_string(),
        TEST_OTP_SECRET.to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg
}

/// Application state over a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DbPool>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub auth: Arc<AuthService>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        // one connection keeps the in-memory database alive and shared
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("sqlite memory pool");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = FakeGateway::new();
        let notifier = RecordingNotifier::new();
        let users: Arc<dyn UserLookup> = Arc::new(DbUserLookup::new(db.clone()));
        let services = AppServices::with_collaborators(
            db.clone(),
            &cfg,
            event_sender.clone(),
            gateway.clone(),
            users,
            notifier.clone(),
        );

        let auth = Arc::new(AuthService::new(AuthConfig::new(cfg.jwt_secret.clone())));
        let state = AppState {
            db: db.clone(),
            config: cfg,
            event_sender,
            services,
            auth: auth.clone(),
        };
        let router = orderpay_api::build_router(state.clone());

        Self {
            router,
            state,
            db,
            gateway,
            notifier,
            auth,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.auth
            .generate_token(user_id, &[])
            .expect("user token")
    }

    pub fn admin_token(&self) -> String {
        self.auth
            .generate_token(Uuid::new_v4(), &[ADMIN_ROLE])
            .expect("admin token")
    }

    pub async fn seed_user(&self, email: &str) -> user::Model {
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email.to_string()),
            name: Set(format!("Shopper {}", email)),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed user")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed cart item");
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("product query")
            .expect("product exists")
            .stock
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
            }
            None => Body::empty(),
        };

        let request = builder.body(body).expect("build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn post_raw(&self, uri: &str, payload: Vec<u8>) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .expect("build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
