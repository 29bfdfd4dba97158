use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::services::otp::OneTimeCode;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends and logs a failure instead of returning it.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "domain event dropped");
        }
    }
}

/// Domain events published after the corresponding state change commits.
#[derive(Debug, Clone)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total_amount: Decimal,
    },
    OrderItemAdded {
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),

    // Payment events
    PaymentCreated {
        payment_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    PaymentCompleted {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentFailed {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentCancelled {
        payment_id: Uuid,
        order_id: Uuid,
    },

    // Return events
    ReturnRequested {
        return_id: Uuid,
        order_item_id: Uuid,
    },
    ReturnStatusChanged {
        return_id: Uuid,
        old_status: String,
        new_status: String,
    },
    RefundIssued {
        return_id: Uuid,
        refund_id: String,
        amount: Decimal,
    },
    RefundFailed {
        return_id: Uuid,
        reason: String,
    },

    // Outbound mail
    InvoiceRequested {
        payment_id: Uuid,
        order_id: Uuid,
        order_number: String,
        email: String,
        amount: Decimal,
    },
    OtpDeliveryRequested {
        user_id: Uuid,
        purpose: String,
        destination: String,
        code: OneTimeCode,
    },

    WebhookReceived {
        event_id: String,
        event_type: String,
    },
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::InvoiceRequested {
                payment_id,
                order_id,
                order_number,
                email,
                amount,
            } => {
                if let Err(e) = deliver_invoice(&email, &order_number, amount).await {
                    error!(
                        %payment_id,
                        %order_id,
                        error = %e,
                        "Failed to deliver invoice"
                    );
                }
            }
            Event::OtpDeliveryRequested {
                user_id,
                purpose,
                destination,
                code,
            } => {
                if let Err(e) = deliver_otp(&destination, &purpose, &code).await {
                    error!(%user_id, %purpose, error = %e, "Failed to deliver one-time code");
                }
            }
            Event::RefundFailed { return_id, reason } => {
                warn!(%return_id, %reason, "refund failed, return awaits retry");
            }
            other => {
                info!(event = ?other, "domain event");
            }
        }
    }

    info!("Event processing loop stopped");
}

// Mail transport lives outside this service; hand-off is recorded in the log.
async fn deliver_invoice(email: &str, order_number: &str, amount: Decimal) -> Result<(), String> {
    if email.is_empty() {
        return Err("no recipient address".to_string());
    }
    info!(recipient = %email, %order_number, %amount, "invoice handed to mailer");
    Ok(())
}

async fn deliver_otp(destination: &str, purpose: &str, code: &OneTimeCode) -> Result<(), String> {
    if destination.is_empty() {
        return Err("no destination".to_string());
    }
    info!(%destination, %purpose, code = ?code, "one-time code handed to mailer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        drop(rx);
        let result = sender.send(Event::OrderCancelled(Uuid::new_v4())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn loop_exits_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender
            .send(Event::OrderCancelled(Uuid::new_v4()))
            .await
            .unwrap();
        drop(sender);
        tokio::time::timeout(std::time::Duration::from_secs(1), process_events(rx))
            .await
            .expect("loop should stop");
    }

    #[test]
    fn otp_event_debug_masks_code() {
        let event = Event::OtpDeliveryRequested {
            user_id: Uuid::nil(),
            purpose: "password_reset".into(),
            destination: "a@example.com".into(),
            code: OneTimeCode::new("123456".into()),
        };
        assert!(!format!("{:?}", event).contains("123456"));
    }
}
