use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ensure_owner, validate_request};
use crate::{
    auth::AuthUser,
    entities::return_request::{self, ReturnStatus},
    errors::ServiceError,
    services::returns::ReturnRequest,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
pub struct UpdateReturnStatusRequest {
    pub status: ReturnStatus,
}

pub async fn create_return(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ReturnRequest>,
) -> Result<(StatusCode, Json<ApiResponse<return_request::Model>>), ServiceError> {
    validate_request(&request)?;
    let created = state
        .services
        .returns
        .request_return(user.user_id, request.order_item_id, &request.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn list_returns(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<return_request::Model>> {
    let returns = state
        .services
        .returns
        .list_returns_for_user(user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(returns)))
}

pub async fn get_return(
    State(state): State<AppState>,
    user: AuthUser,
    Path(return_id): Path<Uuid>,
) -> ApiResult<return_request::Model> {
    let found = state.services.returns.get_return(return_id).await?;
    ensure_owner(&user, found.user_id, "Return", return_id)?;
    Ok(Json(ApiResponse::success(found)))
}

/// Approving issues the refund inline; the call fails if the refund does.
pub async fn update_return_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(return_id): Path<Uuid>,
    Json(request): Json<UpdateReturnStatusRequest>,
) -> ApiResult<return_request::Model> {
    user.require_admin()?;
    let updated = state
        .services
        .returns
        .update_status(return_id, request.status)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

pub async fn cancel_return(
    State(state): State<AppState>,
    user: AuthUser,
    Path(return_id): Path<Uuid>,
) -> ApiResult<return_request::Model> {
    let returns = &state.services.returns;
    let found = returns.get_return(return_id).await?;
    ensure_owner(&user, found.user_id, "Return", return_id)?;

    let cancelled = returns.cancel_return(return_id).await?;
    Ok(Json(ApiResponse::success(cancelled)))
}

/// Operator retry for a refund that failed earlier.
pub async fn retry_refund(
    State(state): State<AppState>,
    user: AuthUser,
    Path(return_id): Path<Uuid>,
) -> ApiResult<return_request::Model> {
    user.require_admin()?;
    let refunded = state.services.returns.process_refund(return_id).await?;
    Ok(Json(ApiResponse::success(refunded)))
}
