use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{ensure_owner, validate_request};
use crate::{
    auth::AuthUser,
    entities::order::{self, OrderStatus},
    errors::ServiceError,
    services::orders::{OrderLineRequest, OrderWithItems},
    ApiResponse, ApiResult, AppState,
};

/// Omitting `items` checks out the caller's cart.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 100, message = "An order needs between 1 and 100 lines"))]
    pub items: Option<Vec<OrderLineRequest>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub order_id: Uuid,
    pub cancelled: bool,
}

pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderWithItems>>), ServiceError> {
    validate_request(&request)?;
    let orders = &state.services.orders;

    let created = match request.items {
        Some(items) => {
            for line in &items {
                validate_request(line)?;
            }
            orders.create_from_items(user.user_id, items).await?
        }
        None => orders.create_from_cart(user.user_id).await?,
    };

    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<order::Model>> {
    let orders = state
        .services
        .orders
        .list_orders_for_user(user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderWithItems> {
    let found = state.services.orders.get_order(order_id).await?;
    ensure_owner(&user, found.order.user_id, "Order", order_id)?;
    Ok(Json(ApiResponse::success(found)))
}

pub async fn add_order_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
    Json(request): Json<AddItemRequest>,
) -> ApiResult<OrderWithItems> {
    validate_request(&request)?;
    let updated = state
        .services
        .orders
        .add_item(user.user_id, order_id, request.product_id, request.quantity)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<order::Model> {
    user.require_admin()?;
    let updated = state
        .services
        .orders
        .update_status(order_id, request.status)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<CancelResponse> {
    let orders = &state.services.orders;
    let found = orders.get_order(order_id).await?;
    ensure_owner(&user, found.order.user_id, "Order", order_id)?;

    let cancelled = orders.cancel(order_id).await?;
    Ok(Json(ApiResponse::success(CancelResponse {
        order_id,
        cancelled,
    })))
}
