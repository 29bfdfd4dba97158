//! Capture, webhook and cancellation paths converging on one payment outcome.

mod common;

use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};
use orderpay_api::{
    entities::{
        order::{self, OrderStatus},
        payment::PaymentStatus,
        webhook_event::{self, WebhookEventStatus},
    },
    errors::ServiceError,
    services::{
        gateway::{CaptureStatus, GatewayError, GatewayOrderState, RemoteOrderStatus},
        orders::OrderLineRequest,
        payments::CheckoutSession,
    },
    webhooks::Enqueued,
};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::json;
use uuid::Uuid;

struct Checkout {
    user_id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    session: CheckoutSession,
}

async fn checkout(app: &TestApp) -> Checkout {
    let user = app.seed_user(&format!("{}@example.com", Uuid::new_v4().simple())).await;
    let product = app.seed_product("Headphones", dec!(20.00), 10).await;
    let placed = app
        .state
        .services
        .orders
        .create_from_items(
            user.id,
            vec![OrderLineRequest {
                product_id: product.id,
                quantity: 2,
            }],
        )
        .await
        .expect("order placed");
    let session = app
        .state
        .services
        .payments
        .create_payment(placed.order.id)
        .await
        .expect("payment created");
    Checkout {
        user_id: user.id,
        order_id: placed.order.id,
        product_id: product.id,
        session,
    }
}

async fn order_status(app: &TestApp, order_id: Uuid) -> OrderStatus {
    order::Entity::find_by_id(order_id)
        .one(&*app.db)
        .await
        .expect("order query")
        .expect("order exists")
        .status
}

fn approved_webhook(event_id: &str, gateway_order_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "event_type": "CHECKOUT.ORDER.APPROVED",
        "resource": { "id": gateway_order_id, "status": "APPROVED" }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn checkout_and_capture_over_http() {
    let app = TestApp::new().await;
    let user = app.seed_user("buyer@example.com").await;
    let product = app.seed_product("Keyboard", dec!(35.00), 3).await;
    let token = app.token_for(user.id);

    let created = response_json(
        app.request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [{ "product_id": product.id, "quantity": 1 }] })),
            Some(&token),
        )
        .await,
    )
    .await;
    let order_id = created["data"]["id"].as_str().expect("order id").to_string();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "order_id": order_id })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let session = response_json(response).await;
    let gateway_order_id = session["data"]["gateway_order_id"]
        .as_str()
        .expect("gateway order id")
        .to_string();
    assert!(session["data"]["approve_url"]
        .as_str()
        .unwrap_or_default()
        .contains(&gateway_order_id));

    // asking again reuses the session
    let again = app
        .request(
            Method::POST,
            "/api/v1/payments",
            Some(json!({ "order_id": order_id })),
            Some(&token),
        )
        .await;
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(app.gateway.creates.load(Ordering::SeqCst), 1);

    let captured = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/capture?orderId={gateway_order_id}"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(captured.status(), StatusCode::OK);
    let body = response_json(captured).await;
    assert_eq!(body["data"]["newly_completed"], true);
    assert_eq!(body["data"]["payment"]["status"], "Completed");

    let order = response_json(
        app.request(
            Method::GET,
            &format!("/api/v1/orders/{order_id}"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    assert_eq!(order["data"]["status"], "Paid");
    assert_eq!(app.notifier.invoices().len(), 1);
}

#[tokio::test]
async fn double_capture_completes_once() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    let payments = app.state.services.payments.clone();
    let gw = c.session.gateway_order_id.clone();

    let (first, second) = tokio::join!(payments.capture(&gw), payments.capture(&gw));
    let first = first.expect("first capture");
    let second = second.expect("second capture");

    assert_eq!(first.payment.status, PaymentStatus::Completed);
    assert_eq!(second.payment.status, PaymentStatus::Completed);
    assert_eq!(
        [first.newly_completed, second.newly_completed]
            .iter()
            .filter(|n| **n)
            .count(),
        1
    );
    assert_eq!(first.payment.capture_id, second.payment.capture_id);
    assert_eq!(app.notifier.invoices(), vec![first.payment.id]);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Paid);

    // a later replay is served from the stored record
    let replay = payments.capture(&gw).await.expect("replay");
    assert!(!replay.newly_completed);
    assert_eq!(app.notifier.invoices().len(), 1);
}

#[tokio::test]
async fn webhook_and_capture_race_to_a_single_completion() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    let gw = c.session.gateway_order_id.clone();

    let inbox = app.state.services.webhooks.clone();
    assert_matches!(
        inbox.enqueue(&approved_webhook("WH-race", &gw)).await,
        Ok(Enqueued::Accepted(_))
    );

    let payments = app.state.services.payments.clone();
    let (drained, captured) = tokio::join!(inbox.drain_once(), payments.capture(&gw));
    assert_eq!(drained.expect("drain"), 1);
    assert_eq!(captured.expect("capture").payment.status, PaymentStatus::Completed);

    assert_eq!(app.notifier.invoices().len(), 1);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Paid);

    let stored = webhook_event::Entity::find()
        .all(&*app.db)
        .await
        .expect("webhook rows");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, WebhookEventStatus::Processed);
}

#[tokio::test]
async fn lost_capture_response_is_resolved_by_lookup() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    app.gateway.lose_capture_responses();

    let outcome = app
        .state
        .services
        .payments
        .capture(&c.session.gateway_order_id)
        .await
        .expect("capture resolved");

    assert!(outcome.newly_completed);
    assert!(outcome.payment.capture_id.is_some());
    assert_eq!(app.gateway.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Paid);
}

#[tokio::test]
async fn declined_capture_fails_the_payment_but_not_the_order() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    app.gateway.script_capture(Ok(GatewayOrderState {
        status: RemoteOrderStatus::Completed,
        capture_id: Some("CAP-DECLINED".to_string()),
        capture_status: Some(CaptureStatus::Declined),
        captured_amount: None,
    }));

    let result = app
        .state
        .services
        .payments
        .capture(&c.session.gateway_order_id)
        .await;
    assert_matches!(result, Err(ServiceError::Gateway(GatewayError::Rejected(_))));

    let payment = app
        .state
        .services
        .payments
        .find_by_gateway_order_id(&c.session.gateway_order_id)
        .await
        .expect("lookup")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Pending);
    assert!(app.notifier.invoices().is_empty());
}

#[tokio::test]
async fn cancelled_checkout_cannot_be_captured() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    let payments = app.state.services.payments.clone();
    let gw = c.session.gateway_order_id.clone();

    assert!(payments.cancel(&gw).await.expect("cancel"));
    assert!(!payments.cancel(&gw).await.expect("second cancel"));
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Cancelled);
    assert_eq!(app.stock_of(c.product_id).await, 10);

    assert_matches!(
        payments.capture(&gw).await,
        Err(ServiceError::InvalidTransition { .. })
    );
    assert_eq!(app.gateway.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn order_cancelled_directly_voids_its_pending_payment() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;

    assert!(app
        .state
        .services
        .orders
        .cancel(c.order_id)
        .await
        .expect("order cancel"));

    let payment = app
        .state
        .services
        .payments
        .find_by_gateway_order_id(&c.session.gateway_order_id)
        .await
        .expect("lookup")
        .expect("payment");
    assert_eq!(payment.status, PaymentStatus::Cancelled);

    assert_matches!(
        app.state
            .services
            .payments
            .create_payment(c.order_id)
            .await,
        Err(ServiceError::OrderNotPayable { .. })
    );
}

#[tokio::test]
async fn adding_items_voids_the_open_checkout() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    let stale = c.session.gateway_order_id.clone();
    let amplifier = app.seed_product("Amplifier", dec!(1000.00), 1).await;

    let updated = app
        .state
        .services
        .orders
        .add_item(c.user_id, c.order_id, amplifier.id, 1)
        .await
        .expect("item added");
    assert_eq!(updated.order.total_amount, dec!(1040.00));

    let payments = app.state.services.payments.clone();
    let voided = payments
        .find_by_gateway_order_id(&stale)
        .await
        .expect("lookup")
        .expect("payment");
    assert_eq!(voided.status, PaymentStatus::Cancelled);

    // the buyer approving the old 40.00 session cannot settle a 1040.00 order
    assert_matches!(
        payments.capture(&stale).await,
        Err(ServiceError::InvalidTransition { .. })
    );
    assert_eq!(app.gateway.captures.load(Ordering::SeqCst), 0);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Pending);
    assert!(app.notifier.invoices().is_empty());

    let fresh = payments
        .create_payment(c.order_id)
        .await
        .expect("new checkout");
    assert!(!fresh.reused);
    assert_ne!(fresh.gateway_order_id, stale);
    assert_eq!(fresh.amount, dec!(1040.00));

    let captured = payments
        .capture(&fresh.gateway_order_id)
        .await
        .expect("capture");
    assert!(captured.newly_completed);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Paid);
    assert_eq!(app.notifier.invoices(), vec![fresh.payment_id]);
}

#[tokio::test]
async fn capture_webhook_settles_a_remotely_captured_order() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    let gw = c.session.gateway_order_id.clone();
    app.gateway.settle_remotely(&gw);

    let payload = json!({
        "id": "WH-capture-1",
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": format!("CAP-{gw}"),
            "status": "COMPLETED",
            "supplementary_data": { "related_ids": { "order_id": gw } }
        }
    })
    .to_string()
    .into_bytes();

    let inbox = app.state.services.webhooks.clone();
    let id = match inbox.enqueue(&payload).await.expect("enqueue") {
        Enqueued::Accepted(id) => id,
        Enqueued::Duplicate => panic!("first delivery reported as duplicate"),
    };
    assert_eq!(
        inbox.process_event(id).await.expect("process"),
        Some(WebhookEventStatus::Processed)
    );

    assert_eq!(app.gateway.captures.load(Ordering::SeqCst), 0);
    assert_eq!(order_status(&app, c.order_id).await, OrderStatus::Paid);
    assert_eq!(app.notifier.invoices().len(), 1);

    // redelivery is acknowledged without a second pass
    assert_matches!(inbox.enqueue(&payload).await, Ok(Enqueued::Duplicate));
    assert_eq!(inbox.drain_once().await.expect("drain"), 0);
}

#[tokio::test]
async fn webhook_endpoint_acknowledges_and_deduplicates() {
    let app = TestApp::new().await;
    let c = checkout(&app).await;
    let payload = approved_webhook("WH-http-1", &c.session.gateway_order_id);

    let first = app.post_raw("/api/v1/webhooks/paypal", payload.clone()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(response_json(first).await["status"], "accepted");

    let second = app.post_raw("/api/v1/webhooks/paypal", payload).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(response_json(second).await["status"], "duplicate");

    let malformed = app
        .post_raw("/api/v1/webhooks/paypal", b"{\"nope\":true}".to_vec())
        .await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_for_unknown_payment_is_parked_after_retries() {
    let mut cfg = common::test_config();
    cfg.webhook_max_attempts = 2;
    let app = TestApp::with_config(cfg).await;
    let inbox = app.state.services.webhooks.clone();

    let id = match inbox
        .enqueue(&approved_webhook("WH-orphan", "GW-UNKNOWN"))
        .await
        .expect("enqueue")
    {
        Enqueued::Accepted(id) => id,
        Enqueued::Duplicate => panic!("unexpected duplicate"),
    };

    assert_eq!(
        inbox.process_event(id).await.expect("first attempt"),
        Some(WebhookEventStatus::Pending)
    );
    assert_eq!(
        inbox.process_event(id).await.expect("second attempt"),
        Some(WebhookEventStatus::Failed)
    );
    assert_eq!(inbox.process_event(id).await.expect("parked"), None);

    let row = webhook_event::Entity::find_by_id(id)
        .one(&*app.db)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.attempts, 2);
    assert!(row.last_error.is_some());
}
