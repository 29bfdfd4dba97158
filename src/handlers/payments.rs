use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ensure_owner;
use crate::{
    auth::AuthUser,
    entities::payment,
    errors::ServiceError,
    services::payments::{CaptureOutcome, CheckoutSession},
    ApiResponse, ApiResult, AppState,
};

/// Only the order is named; the charge is always the order's own total.
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: Uuid,
}

/// `orderId` is the gateway order id, as PayPal appends it to the return URL.
#[derive(Debug, Deserialize)]
pub struct GatewayOrderQuery {
    #[serde(rename = "orderId", alias = "token")]
    pub order_id: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentCancelResponse {
    pub gateway_order_id: String,
    pub cancelled: bool,
}

pub async fn create_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutSession>>), ServiceError> {
    let order = state.services.orders.get_order(request.order_id).await?;
    ensure_owner(&user, order.order.user_id, "Order", request.order_id)?;

    let session = state
        .services
        .payments
        .create_payment(request.order_id)
        .await?;
    let status = if session.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(session))))
}

pub async fn capture_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<GatewayOrderQuery>,
) -> ApiResult<CaptureOutcome> {
    owned_payment(&state, &user, &query.order_id).await?;
    let outcome = state.services.payments.capture(&query.order_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<GatewayOrderQuery>,
) -> ApiResult<PaymentCancelResponse> {
    owned_payment(&state, &user, &query.order_id).await?;
    let cancelled = state.services.payments.cancel(&query.order_id).await?;
    Ok(Json(ApiResponse::success(PaymentCancelResponse {
        gateway_order_id: query.order_id,
        cancelled,
    })))
}

async fn owned_payment(
    state: &AppState,
    user: &AuthUser,
    gateway_order_id: &str,
) -> Result<payment::Model, ServiceError> {
    let not_found =
        || ServiceError::NotFound(format!("Payment for gateway order {} not found", gateway_order_id));
    let payment = state
        .services
        .payments
        .find_by_gateway_order_id(gateway_order_id)
        .await?
        .ok_or_else(not_found)?;
    let order = state.services.orders.get_order(payment.order_id).await?;
    ensure_owner(user, order.order.user_id, "Payment for gateway order", gateway_order_id)?;
    Ok(payment)
}
