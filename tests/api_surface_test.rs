//! Health, metrics, authentication and step-up codes over HTTP.

mod common;

use axum::{
    body,
    http::{Method, StatusCode},
};
use common::{response_json, TestApp};
use serde_json::json;

#[tokio::test]
async fn health_reports_the_database() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = response_json(response).await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn metrics_are_exposed_as_text() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/metrics", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("metrics body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("payments_completed_total"));
}

#[tokio::test]
async fn bad_tokens_are_rejected() {
    let app = TestApp::new().await;

    let missing = app.request(Method::GET, "/api/v1/orders", None, None).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let garbage = app
        .request(Method::GET, "/api/v1/orders", None, Some("not-a-jwt"))
        .await;
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);

    let user = app.seed_user("valid@example.com").await;
    let valid = app
        .request(Method::GET, "/api/v1/orders", None, Some(&app.token_for(user.id)))
        .await;
    assert_eq!(valid.status(), StatusCode::OK);
}

#[tokio::test]
async fn step_up_code_is_single_use() {
    let app = TestApp::new().await;
    let user = app.seed_user("stepup@example.com").await;
    let token = app.token_for(user.id);

    let requested = app
        .request(
            Method::POST,
            "/api/v1/otp/request",
            Some(json!({
                "purpose": "payment_email_verification",
                "destination": "stepup@example.com"
            })),
            Some(&token),
        )
        .await;
    assert_eq!(requested.status(), StatusCode::ACCEPTED);
    let code = app.notifier.last_otp_code().expect("code delivered");
    assert_eq!(code.len(), 6);

    let wrong = if code == "123456" { "654321" } else { "123456" };
    let rejected = app
        .request(
            Method::POST,
            "/api/v1/otp/verify",
            Some(json!({ "purpose": "payment_email_verification", "code": wrong })),
            Some(&token),
        )
        .await;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let verified = app
        .request(
            Method::POST,
            "/api/v1/otp/verify",
            Some(json!({ "purpose": "payment_email_verification", "code": code })),
            Some(&token),
        )
        .await;
    assert_eq!(verified.status(), StatusCode::OK);
    assert_eq!(response_json(verified).await["data"]["verified"], true);

    let replayed = app
        .request(
            Method::POST,
            "/api/v1/otp/verify",
            Some(json!({ "purpose": "payment_email_verification", "code": code })),
            Some(&token),
        )
        .await;
    assert_eq!(replayed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn step_up_codes_do_not_cross_purposes() {
    let app = TestApp::new().await;
    let user = app.seed_user("purpose@example.com").await;
    let token = app.token_for(user.id);

    app.request(
        Method::POST,
        "/api/v1/otp/request",
        Some(json!({ "purpose": "password_reset", "destination": "purpose@example.com" })),
        Some(&token),
    )
    .await;
    let code = app.notifier.last_otp_code().expect("code delivered");

    let other_purpose = app
        .request(
            Method::POST,
            "/api/v1/otp/verify",
            Some(json!({ "purpose": "payment_email_verification", "code": code })),
            Some(&token),
        )
        .await;
    assert_eq!(other_purpose.status(), StatusCode::BAD_REQUEST);

    let invalid_destination = app
        .request(
            Method::POST,
            "/api/v1/otp/request",
            Some(json!({ "purpose": "password_reset", "destination": "not-an-email" })),
            Some(&token),
        )
        .await;
    assert_eq!(invalid_destination.status(), StatusCode::BAD_REQUEST);
}
