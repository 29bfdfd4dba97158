//! Durable inbox for PayPal webhook deliveries.
//!
//! Deliveries are stored before they are acknowledged and reconciled by a
//! background drain. Payloads are never trusted for state: each event only
//! tells the payment reconciler which gateway order to re-query.

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    db::{self, DbPool},
    entities::webhook_event::{self, Entity as WebhookEventEntity, WebhookEventStatus},
    errors::ServiceError,
    services::payments::PaymentReconciler,
};

const DRAIN_BATCH: u64 = 50;
/// A `processing` row older than this is assumed abandoned by a crashed worker.
const STALE_CLAIM_MINUTES: i64 = 5;

#[derive(Debug, Deserialize)]
struct PayPalWebhook {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: Value,
}

/// The parts of a delivery the inbox cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWebhook {
    pub event_id: String,
    pub event_type: String,
    /// Gateway order the event refers to, when it names one
    pub gateway_order_id: Option<String>,
}

pub fn parse_webhook(payload: &[u8]) -> Result<ParsedWebhook, ServiceError> {
    let event: PayPalWebhook = serde_json::from_slice(payload)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))?;
    if event.id.trim().is_empty() || event.event_type.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "webhook is missing id or event_type".to_string(),
        ));
    }

    let gateway_order_id = if event.event_type.starts_with("CHECKOUT.ORDER.") {
        event.resource.get("id").and_then(Value::as_str)
    } else if event.event_type.starts_with("PAYMENT.CAPTURE.") {
        event
            .resource
            .pointer("/supplementary_data/related_ids/order_id")
            .and_then(Value::as_str)
    } else {
        None
    }
    .map(str::to_string);

    Ok(ParsedWebhook {
        event_id: event.id,
        event_type: event.event_type,
        gateway_order_id,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted(Uuid),
    /// The provider redelivered an event already stored
    Duplicate,
}

pub struct WebhookInbox {
    db_pool: Arc<DbPool>,
    payments: Arc<PaymentReconciler>,
    max_attempts: i32,
}

impl WebhookInbox {
    pub fn new(db_pool: Arc<DbPool>, payments: Arc<PaymentReconciler>, max_attempts: i32) -> Self {
        Self {
            db_pool,
            payments,
            max_attempts,
        }
    }

    /// Stores a delivery. Redeliveries of a known event id are reported as
    /// duplicates and stored nowhere.
    pub async fn enqueue(&self, payload: &[u8]) -> Result<Enqueued, ServiceError> {
        let parsed = parse_webhook(payload)?;
        crate::metrics::WEBHOOKS_RECEIVED.inc();

        let now = Utc::now();
        let inserted = webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            event_id: Set(parsed.event_id.clone()),
            event_type: Set(parsed.event_type.clone()),
            resource_id: Set(parsed.gateway_order_id.clone()),
            payload: Set(String::from_utf8_lossy(payload).into_owned()),
            status: Set(WebhookEventStatus::Pending),
            attempts: Set(0),
            last_error: Set(None),
            received_at: Set(now),
            updated_at: Set(now),
            processed_at: Set(None),
        }
        .insert(&*self.db_pool)
        .await;

        match inserted {
            Ok(row) => {
                info!(event_id = %row.event_id, event_type = %row.event_type, "webhook stored");
                Ok(Enqueued::Accepted(row.id))
            }
            Err(e) if db::is_unique_violation(&e) => {
                crate::metrics::WEBHOOKS_DUPLICATE.inc();
                info!(event_id = %parsed.event_id, "duplicate webhook delivery");
                Ok(Enqueued::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claims and reconciles one stored event. Returns `None` when another
    /// worker holds it or it is already settled.
    pub async fn process_event(
        &self,
        id: Uuid,
    ) -> Result<Option<WebhookEventStatus>, ServiceError> {
        let db = &*self.db_pool;
        let claimed = WebhookEventEntity::update_many()
            .col_expr(webhook_event::Column::Status, Expr::value(WebhookEventStatus::Processing))
            .col_expr(
                webhook_event::Column::Attempts,
                Expr::col(webhook_event::Column::Attempts).add(1),
            )
            .col_expr(webhook_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(webhook_event::Column::Id.eq(id))
            .filter(webhook_event::Column::Status.eq(WebhookEventStatus::Pending))
            .exec(db)
            .await?;
        if claimed.rows_affected == 0 {
            return Ok(None);
        }

        let event = WebhookEventEntity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Webhook event {} not found", id)))?;

        let outcome = match event.resource_id.as_deref() {
            Some(gateway_order_id) => {
                self.payments
                    .reconcile_webhook(&event.event_type, gateway_order_id)
                    .await
            }
            None => {
                debug!(event_type = %event.event_type, "webhook carries no order reference");
                Ok(false)
            }
        };

        let now = Utc::now();
        let (status, last_error, processed_at) = match outcome {
            Ok(changed) => {
                info!(event_id = %event.event_id, changed, "webhook reconciled");
                (WebhookEventStatus::Processed, None, Some(now))
            }
            Err(e) if event.attempts >= self.max_attempts => {
                error!(event_id = %event.event_id, attempts = event.attempts, error = %e, "webhook parked after final attempt");
                (WebhookEventStatus::Failed, Some(e.to_string()), None)
            }
            Err(e) => {
                warn!(event_id = %event.event_id, attempts = event.attempts, error = %e, "webhook reconciliation failed, will retry");
                (WebhookEventStatus::Pending, Some(e.to_string()), None)
            }
        };

        WebhookEventEntity::update_many()
            .col_expr(webhook_event::Column::Status, Expr::value(status))
            .col_expr(webhook_event::Column::LastError, Expr::value(last_error))
            .col_expr(webhook_event::Column::ProcessedAt, Expr::value(processed_at))
            .col_expr(webhook_event::Column::UpdatedAt, Expr::value(now))
            .filter(webhook_event::Column::Id.eq(id))
            .filter(webhook_event::Column::Status.eq(WebhookEventStatus::Processing))
            .exec(db)
            .await?;
        Ok(Some(status))
    }

    /// One pass of the drain: releases abandoned claims, then works through
    /// pending events oldest first. Returns how many were claimed.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let db = &*self.db_pool;
        let released = WebhookEventEntity::update_many()
            .col_expr(webhook_event::Column::Status, Expr::value(WebhookEventStatus::Pending))
            .col_expr(webhook_event::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(webhook_event::Column::Status.eq(WebhookEventStatus::Processing))
            .filter(
                webhook_event::Column::UpdatedAt
                    .lt(Utc::now() - chrono::Duration::minutes(STALE_CLAIM_MINUTES)),
            )
            .exec(db)
            .await?;
        if released.rows_affected > 0 {
            warn!(count = released.rows_affected, "released stale webhook claims");
        }

        let pending: Vec<Uuid> = WebhookEventEntity::find()
            .select_only()
            .column(webhook_event::Column::Id)
            .filter(webhook_event::Column::Status.eq(WebhookEventStatus::Pending))
            .order_by_asc(webhook_event::Column::ReceivedAt)
            .limit(DRAIN_BATCH)
            .into_tuple()
            .all(db)
            .await?;

        let mut claimed = 0;
        for id in pending {
            if self.process_event(id).await?.is_some() {
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    /// Runs `drain_once` on a fixed interval until the task is aborted.
    pub fn start_worker(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = every.as_millis() as u64, "webhook drain worker started");
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match self.drain_once().await {
                    Ok(0) => {}
                    Ok(n) => debug!(events = n, "webhook drain pass"),
                    Err(e) => warn!(error = %e, "webhook drain pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checkout_events_reference_the_resource_id() {
        let payload = json!({
            "id": "WH-1",
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource": { "id": "5O190127TN364715T", "status": "APPROVED" }
        });
        let parsed = parse_webhook(payload.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.event_id, "WH-1");
        assert_eq!(parsed.gateway_order_id.as_deref(), Some("5O190127TN364715T"));
    }

    #[test]
    fn capture_events_reference_the_related_order() {
        let payload = json!({
            "id": "WH-2",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAPTURE-9",
                "status": "COMPLETED",
                "supplementary_data": { "related_ids": { "order_id": "ORDER-9" } }
            }
        });
        let parsed = parse_webhook(payload.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.gateway_order_id.as_deref(), Some("ORDER-9"));
    }

    #[test]
    fn unrelated_events_have_no_reference() {
        let payload = json!({
            "id": "WH-3",
            "event_type": "CUSTOMER.DISPUTE.CREATED",
            "resource": { "id": "PP-D-1" }
        });
        let parsed = parse_webhook(payload.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.gateway_order_id, None);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(parse_webhook(b"not json").is_err());
        assert!(parse_webhook(br#"{"id":"","event_type":"X"}"#).is_err());
    }
}
