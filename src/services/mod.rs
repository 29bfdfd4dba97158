//! Business services for checkout, payment reconciliation and returns.
//!
//! Services take a `DbPool` and open their own transactions; the
//! `*_in_txn` helpers compose into a caller's transaction instead.

pub mod collaborators;
pub mod gateway;
pub mod orders;
pub mod otp;
pub mod payments;
pub mod returns;
pub mod stock_ledger;

use std::sync::Arc;

use crate::{config::AppConfig, db::DbPool, events::EventSender, webhooks::WebhookInbox};
use collaborators::{
    DbCartSource, DbProductCatalog, DbUserLookup, EventNotifier, Notifier, UserLookup,
};
use gateway::PaymentGateway;

/// Service registry shared through the HTTP state.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<orders::OrderLifecycle>,
    pub payments: Arc<payments::PaymentReconciler>,
    pub returns: Arc<returns::ReturnRefundProcessor>,
    pub otp: Arc<otp::OtpStepUpAuthority>,
    pub webhooks: Arc<WebhookInbox>,
}

impl AppServices {
    /// Wires the services over the store-backed collaborators.
    pub fn new(
        db: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let notifier: Arc<dyn Notifier> = Arc::new(EventNotifier::new(event_sender.clone()));
        let users: Arc<dyn UserLookup> = Arc::new(DbUserLookup::new(db.clone()));
        Self::with_collaborators(db, config, event_sender, gateway, users, notifier)
    }

    /// Wires the services with the given user directory and notifier.
    pub fn with_collaborators(
        db: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        users: Arc<dyn UserLookup>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let orders = Arc::new(orders::OrderLifecycle::new(
            db.clone(),
            Arc::new(DbCartSource),
            Arc::new(DbProductCatalog),
            Some(event_sender.clone()),
        ));
        let payments = Arc::new(payments::PaymentReconciler::new(
            db.clone(),
            gateway.clone(),
            orders.clone(),
            users.clone(),
            notifier.clone(),
            config.currency.clone(),
            Some(event_sender.clone()),
        ));
        let returns = Arc::new(returns::ReturnRefundProcessor::new(
            db.clone(),
            gateway,
            payments.clone(),
            config.return_window(),
            Some(event_sender),
        ));
        let webhooks = Arc::new(WebhookInbox::new(
            db.clone(),
            payments.clone(),
            config.webhook_max_attempts,
        ));
        let otp = Arc::new(otp::OtpStepUpAuthority::new(
            db,
            notifier,
            config.otp_secret.clone(),
            config.otp_ttl(),
            config.otp_max_attempts,
        ));

        Self {
            orders,
            payments,
            returns,
            otp,
            webhooks,
        }
    }
}
