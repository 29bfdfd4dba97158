//! Prometheus counters for the checkout, payment and refund flows, exposed at `/metrics`.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

use crate::errors::ServiceError;

fn register(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric can be created");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric can be registered");
    counter
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref ORDERS_CREATED: IntCounter =
        register(&REGISTRY, "orders_created_total", "Orders created");
    pub static ref ORDERS_CANCELLED: IntCounter =
        register(&REGISTRY, "orders_cancelled_total", "Orders cancelled");
    pub static ref STOCK_RESERVATIONS_REJECTED: IntCounter = register(
        &REGISTRY,
        "stock_reservations_rejected_total",
        "Conditional stock decrements that found too little stock"
    );
    pub static ref PAYMENTS_CREATED: IntCounter =
        register(&REGISTRY, "payments_created_total", "Gateway orders created");
    pub static ref PAYMENTS_COMPLETED: IntCounter =
        register(&REGISTRY, "payments_completed_total", "Payments captured");
    pub static ref PAYMENTS_FAILED: IntCounter =
        register(&REGISTRY, "payments_failed_total", "Payments declined or voided");
    pub static ref REFUNDS_ISSUED: IntCounter =
        register(&REGISTRY, "refunds_issued_total", "Refunds accepted by the gateway");
    pub static ref REFUNDS_FAILED: IntCounter =
        register(&REGISTRY, "refunds_failed_total", "Refund attempts that failed");
    pub static ref WEBHOOKS_RECEIVED: IntCounter =
        register(&REGISTRY, "webhooks_received_total", "Gateway webhooks stored");
    pub static ref WEBHOOKS_DUPLICATE: IntCounter = register(
        &REGISTRY,
        "webhooks_duplicate_total",
        "Gateway webhooks dropped as redeliveries"
    );
    pub static ref INVARIANT_VIOLATIONS: IntCounter = register(
        &REGISTRY,
        "invariant_violations_total",
        "Detected violations of stock, payment or refund invariants"
    );
}

/// Renders every registered metric in the Prometheus text format.
pub fn render() -> Result<String, ServiceError> {
    // touch the lazies so the exposition lists them from the first scrape
    let _ = (
        &*ORDERS_CREATED,
        &*ORDERS_CANCELLED,
        &*STOCK_RESERVATIONS_REJECTED,
        &*PAYMENTS_CREATED,
        &*PAYMENTS_COMPLETED,
        &*PAYMENTS_FAILED,
        &*REFUNDS_ISSUED,
        &*REFUNDS_FAILED,
        &*WEBHOOKS_RECEIVED,
        &*WEBHOOKS_DUPLICATE,
        &*INVARIANT_VIOLATIONS,
    );

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| ServiceError::InternalError(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ServiceError::InternalError(format!("metrics are not utf-8: {}", e)))
}

pub async fn metrics_handler() -> Result<impl IntoResponse, ServiceError> {
    let body = render()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
