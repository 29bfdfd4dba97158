use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validate_request;
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::otp::{OtpIssued, OtpPurpose},
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize, Validate)]
pub struct OtpRequest {
    pub purpose: OtpPurpose,
    #[validate(email(message = "destination must be an email address"))]
    pub destination: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct OtpVerifyRequest {
    pub purpose: OtpPurpose,
    #[validate(length(equal = 6, message = "code must have 6 digits"))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct OtpVerified {
    pub verified: bool,
}

pub async fn request_code(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<OtpRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OtpIssued>>), ServiceError> {
    validate_request(&request)?;
    let issued = state
        .services
        .otp
        .request(user.user_id, request.purpose, &request.destination)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(issued))))
}

pub async fn verify_code(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<OtpVerifyRequest>,
) -> ApiResult<OtpVerified> {
    validate_request(&request)?;
    state
        .services
        .otp
        .verify(user.user_id, request.purpose, &request.code)
        .await?;
    Ok(Json(ApiResponse::success(OtpVerified { verified: true })))
}
