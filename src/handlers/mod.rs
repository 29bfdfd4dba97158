//! HTTP surface. Handlers resolve the caller once, check ownership, and
//! pass ids explicitly into the services.

pub mod health;
pub mod orders;
pub mod otp;
pub mod payments;
pub mod returns;
pub mod webhooks;

use uuid::Uuid;
use validator::Validate;

use crate::{auth::AuthUser, errors::ServiceError};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Runs `validator` rules and flattens failures into one message per field.
pub(crate) fn validate_request<T: Validate>(request: &T) -> Result<(), ServiceError> {
    if let Err(validation_errors) = request.validate() {
        let errors: Vec<String> = validation_errors
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                let field = field.to_string();
                errors.iter().map(move |error| {
                    format!(
                        "{}: {}",
                        field,
                        error
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "Invalid value".to_string())
                    )
                })
            })
            .collect();
        return Err(ServiceError::ValidationError(errors.join("; ")));
    }
    Ok(())
}

/// Someone else's resource reads as missing, so ids do not leak.
pub(crate) fn ensure_owner(
    user: &AuthUser,
    owner_id: Uuid,
    what: &str,
    id: impl std::fmt::Display,
) -> Result<(), ServiceError> {
    if user.user_id == owner_id || user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::NotFound(format!("{} {} not found", what, id)))
    }
}
