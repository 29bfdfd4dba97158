use axum::{extract::State, http::StatusCode, response::Json};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::warn;

use crate::{errors::ServiceError, webhooks::Enqueued, AppState};

/// Stores the delivery and acknowledges it. Reconciliation happens in the
/// background, so a stored event is always answered with 200.
pub async fn paypal_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ServiceError> {
    let inbox = state.services.webhooks.clone();
    let status = match inbox.enqueue(&body).await? {
        Enqueued::Accepted(id) => {
            // best effort; the drain worker picks it up otherwise
            tokio::spawn(async move {
                if let Err(e) = inbox.process_event(id).await {
                    warn!(webhook_id = %id, error = %e, "immediate webhook processing failed");
                }
            });
            "accepted"
        }
        Enqueued::Duplicate => "duplicate",
    };

    Ok((StatusCode::OK, Json(json!({ "status": status }))))
}
