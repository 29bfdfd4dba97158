use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{self, DbPool},
    entities::{
        order::{self, OrderStatus},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        collaborators::{Notifier, UserLookup},
        gateway::{GatewayError, GatewayOrderState, PaymentGateway},
        orders::{MarkPaid, OrderLifecycle},
    },
};

/// Gateway event that means the buyer approved and we should capture.
pub const EVENT_ORDER_APPROVED: &str = "CHECKOUT.ORDER.APPROVED";

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub approve_url: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    /// An existing pending payment was handed back instead of a new one
    pub reused: bool,
}

impl From<(payment::Model, bool)> for CheckoutSession {
    fn from((payment, reused): (payment::Model, bool)) -> Self {
        Self {
            payment_id: payment.id,
            order_id: payment.order_id,
            gateway_order_id: payment.gateway_order_id,
            approve_url: payment.approve_url,
            amount: payment.amount,
            currency: payment.currency,
            reused,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub payment: payment::Model,
    /// This call performed the transition to Completed
    pub newly_completed: bool,
}

enum Applied {
    Completed { payment: payment::Model, newly: bool },
    Failed(payment::Model),
    StillPending(payment::Model),
}

/// Keeps local payments in step with the gateway and drives the order to
/// `Paid`. Capture responses and webhooks converge on the same conditional
/// transition, so whichever arrives first wins and the rest are no-ops.
pub struct PaymentReconciler {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    orders: Arc<OrderLifecycle>,
    users: Arc<dyn UserLookup>,
    notifier: Arc<dyn Notifier>,
    currency: String,
    event_sender: Option<Arc<EventSender>>,
}

impl PaymentReconciler {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        orders: Arc<OrderLifecycle>,
        users: Arc<dyn UserLookup>,
        notifier: Arc<dyn Notifier>,
        currency: String,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            orders,
            users,
            notifier,
            currency,
            event_sender,
        }
    }

    /// Starts checkout for a pending order. The amount is always the
    /// order's own total.
    #[instrument(skip(self))]
    pub async fn create_payment(&self, order_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let db = &*self.db_pool;
        let order = self.orders.find_order(db, order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::OrderNotPayable {
                order_id,
                status: order.status.to_string(),
            });
        }

        if let Some(existing) = Self::pending_payment(db, order_id).await? {
            if existing.amount.round_dp(2) == order.total_amount.round_dp(2) {
                info!(payment_id = %existing.id, "reusing pending payment");
                return Ok((existing, true).into());
            }
            // order total moved since; the old approval link is for the wrong amount
            self.supersede(db, &existing).await?;
        }

        let remote = self
            .gateway
            .create_remote_order(order.total_amount, &self.currency, &order.id.to_string())
            .await
            .map_err(|e| {
                warn!(error = %e, "gateway order creation failed");
                ServiceError::Gateway(e)
            })?;

        let now = Utc::now();
        let inserted = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            gateway_order_id: Set(remote.gateway_order_id.clone()),
            capture_id: Set(None),
            amount: Set(order.total_amount),
            currency: Set(self.currency.clone()),
            refunded_amount: Set(Decimal::ZERO),
            status: Set(PaymentStatus::Pending),
            approve_url: Set(Some(remote.approve_url.clone())),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await;

        let payment = match inserted {
            Ok(payment) => payment,
            Err(e) if db::is_unique_violation(&e) => {
                // a concurrent checkout for the same order got there first
                warn!(gateway_order_id = %remote.gateway_order_id, "discarding duplicate gateway order");
                let winner = Self::pending_payment(db, order_id).await?.ok_or_else(|| {
                    ServiceError::RetryableConflict(format!(
                        "payment for order {} changed concurrently",
                        order_id
                    ))
                })?;
                return Ok((winner, true).into());
            }
            Err(e) => return Err(e.into()),
        };

        crate::metrics::PAYMENTS_CREATED.inc();
        self.publish(Event::PaymentCreated {
            payment_id: payment.id,
            order_id,
            amount: payment.amount,
        })
        .await;
        info!(payment_id = %payment.id, gateway_order_id = %payment.gateway_order_id, amount = %payment.amount, "payment created");
        Ok((payment, false).into())
    }

    /// Captures an approved gateway order. Repeated calls return the stored
    /// result without side effects.
    #[instrument(skip(self))]
    pub async fn capture(&self, gateway_order_id: &str) -> Result<CaptureOutcome, ServiceError> {
        let payment = self.require_payment(gateway_order_id).await?;

        match payment.status {
            PaymentStatus::Completed | PaymentStatus::Refunded => {
                info!(payment_id = %payment.id, "capture replay, returning stored result");
                return Ok(CaptureOutcome {
                    payment,
                    newly_completed: false,
                });
            }
            PaymentStatus::Cancelled | PaymentStatus::Failed => {
                return Err(ServiceError::InvalidTransition {
                    from: payment.status.to_string(),
                    to: PaymentStatus::Completed.to_string(),
                });
            }
            PaymentStatus::Pending => {}
        }

        let order = self
            .orders
            .find_order(&*self.db_pool, payment.order_id)
            .await?;
        if order.status == OrderStatus::Cancelled {
            self.void_pending(&payment).await?;
            return Err(ServiceError::OrderNotPayable {
                order_id: order.id,
                status: order.status.to_string(),
            });
        }

        let (state, capture_err) = self.capture_or_refetch(gateway_order_id).await?;
        match self.apply_remote_state(payment, &state).await? {
            Applied::Completed { payment, newly } => Ok(CaptureOutcome {
                payment,
                newly_completed: newly,
            }),
            Applied::Failed(payment) => Err(ServiceError::Gateway(GatewayError::Rejected(
                format!("payment {} was declined", payment.id),
            ))),
            Applied::StillPending(payment) => match capture_err {
                Some(e) => Err(ServiceError::Gateway(e)),
                None => Ok(CaptureOutcome {
                    payment,
                    newly_completed: false,
                }),
            },
        }
    }

    /// Treats a webhook purely as a prompt to ask the gateway. Returns
    /// whether local state changed.
    #[instrument(skip(self))]
    pub async fn reconcile_webhook(
        &self,
        event_type: &str,
        gateway_order_id: &str,
    ) -> Result<bool, ServiceError> {
        let payment = self.require_payment(gateway_order_id).await?;
        if payment.status.is_terminal() {
            info!(payment_id = %payment.id, status = %payment.status, "webhook replay ignored");
            return Ok(false);
        }

        let state = if event_type == EVENT_ORDER_APPROVED {
            match self.capture_or_refetch(gateway_order_id).await? {
                (state, None) => state,
                (state, Some(e)) if state.is_paid() || state.is_failed() => {
                    info!(error = %e, "capture failed but gateway reports a final state");
                    state
                }
                (_, Some(e)) => return Err(ServiceError::Gateway(e)),
            }
        } else {
            self.gateway.fetch_order(gateway_order_id).await?
        };

        Ok(match self.apply_remote_state(payment, &state).await? {
            Applied::Completed { newly, .. } => newly,
            Applied::Failed(_) => true,
            Applied::StillPending(_) => false,
        })
    }

    /// Abandons checkout: the pending payment becomes Cancelled and the
    /// order is cancelled with it. Returns `false` if already cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, gateway_order_id: &str) -> Result<bool, ServiceError> {
        let payment = self.require_payment(gateway_order_id).await?;
        match payment.status {
            PaymentStatus::Cancelled | PaymentStatus::Failed => return Ok(false),
            PaymentStatus::Completed | PaymentStatus::Refunded => {
                return Err(ServiceError::InvalidTransition {
                    from: payment.status.to_string(),
                    to: PaymentStatus::Cancelled.to_string(),
                })
            }
            PaymentStatus::Pending => {}
        }

        let txn = db::begin(&self.db_pool).await?;
        let result = async {
            let updated = PaymentEntity::update_many()
                .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Cancelled))
                .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(payment::Column::Id.eq(payment.id))
                .filter(payment::Column::Status.eq(PaymentStatus::Pending))
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                let current = Self::load(&txn, payment.id).await?;
                return match current.status {
                    PaymentStatus::Cancelled | PaymentStatus::Failed => Ok((false, false)),
                    other => Err(ServiceError::InvalidTransition {
                        from: other.to_string(),
                        to: PaymentStatus::Cancelled.to_string(),
                    }),
                };
            }
            let order_cancelled = self.orders.cancel_in_txn(&txn, payment.order_id).await?;
            Ok::<_, ServiceError>((true, order_cancelled))
        }
        .await;
        let (cancelled, order_cancelled) = db::finish(txn, result).await?;

        if cancelled {
            self.publish(Event::PaymentCancelled {
                payment_id: payment.id,
                order_id: payment.order_id,
            })
            .await;
            info!(payment_id = %payment.id, "payment cancelled");
        }
        if order_cancelled {
            crate::metrics::ORDERS_CANCELLED.inc();
            self.publish(Event::OrderCancelled(payment.order_id)).await;
        }
        Ok(cancelled)
    }

    pub async fn find_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let found = PaymentEntity::find()
            .filter(payment::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db_pool)
            .await?;
        Ok(found)
    }

    /// The payment that collected money for an order, if any.
    pub async fn captured_payment_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let found = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.is_in([
                PaymentStatus::Completed,
                PaymentStatus::Refunded,
            ]))
            .order_by_desc(payment::Column::PaidAt)
            .one(conn)
            .await?;
        Ok(found)
    }

    /// Books a refund against the payment inside the caller's transaction.
    /// A payment refunded in full becomes `Refunded`.
    pub(crate) async fn apply_refund<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_id: Uuid,
        amount: Decimal,
    ) -> Result<payment::Model, ServiceError> {
        let now = Utc::now();
        PaymentEntity::update_many()
            .col_expr(
                payment::Column::RefundedAmount,
                Expr::col(payment::Column::RefundedAmount).add(amount),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment_id))
            .exec(conn)
            .await?;

        PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Refunded))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .filter(
                Expr::col(payment::Column::RefundedAmount).gte(Expr::col(payment::Column::Amount)),
            )
            .exec(conn)
            .await?;

        let updated = Self::load(conn, payment_id).await?;
        if updated.refunded_amount.round_dp(2) > updated.amount.round_dp(2) {
            crate::metrics::INVARIANT_VIOLATIONS.inc();
            error!(
                invariant = true,
                %payment_id,
                refunded = %updated.refunded_amount,
                amount = %updated.amount,
                "refunds exceed captured amount"
            );
        }
        Ok(updated)
    }

    async fn load<C: ConnectionTrait>(
        conn: &C,
        payment_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        PaymentEntity::find_by_id(payment_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    async fn require_payment(&self, gateway_order_id: &str) -> Result<payment::Model, ServiceError> {
        self.find_by_gateway_order_id(gateway_order_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Payment for gateway order {} not found",
                    gateway_order_id
                ))
            })
    }

    async fn pending_payment<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let found = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .one(conn)
            .await?;
        Ok(found)
    }

    async fn supersede<C: ConnectionTrait>(
        &self,
        conn: &C,
        stale: &payment::Model,
    ) -> Result<(), ServiceError> {
        let result = PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Cancelled))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(stale.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::RetryableConflict(format!(
                "payment {} changed while starting checkout",
                stale.id
            )));
        }
        info!(payment_id = %stale.id, "stale pending payment superseded");
        Ok(())
    }

    async fn void_pending(&self, payment: &payment::Model) -> Result<(), ServiceError> {
        PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Cancelled))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&*self.db_pool)
            .await?;
        Ok(())
    }

    /// Captures, and on any failure asks the gateway for the order's real
    /// state instead of assuming the capture failed.
    async fn capture_or_refetch(
        &self,
        gateway_order_id: &str,
    ) -> Result<(GatewayOrderState, Option<GatewayError>), ServiceError> {
        match self.gateway.capture(gateway_order_id).await {
            Ok(state) => Ok((state, None)),
            Err(capture_err) => {
                warn!(error = %capture_err, "capture failed, re-querying gateway");
                match self.gateway.fetch_order(gateway_order_id).await {
                    Ok(state) => Ok((state, Some(capture_err))),
                    Err(fetch_err) => {
                        warn!(error = %fetch_err, "re-query failed, outcome unknown");
                        Err(ServiceError::Gateway(capture_err))
                    }
                }
            }
        }
    }

    async fn apply_remote_state(
        &self,
        payment: payment::Model,
        state: &GatewayOrderState,
    ) -> Result<Applied, ServiceError> {
        if state.is_paid() {
            let (payment, newly) = self.complete_payment(payment, state).await?;
            return Ok(Applied::Completed { payment, newly });
        }
        if state.is_failed() {
            return Ok(Applied::Failed(self.fail_payment(payment).await?));
        }
        info!(payment_id = %payment.id, remote_status = ?state.status, "gateway order not final yet");
        Ok(Applied::StillPending(payment))
    }

    /// The single `-> Completed` transition. A payment cancelled locally
    /// while the capture was in flight is still recorded, since the money
    /// was collected.
    async fn complete_payment(
        &self,
        payment: payment::Model,
        state: &GatewayOrderState,
    ) -> Result<(payment::Model, bool), ServiceError> {
        let capture_id = state.capture_id.clone().ok_or_else(|| {
            ServiceError::Gateway(GatewayError::Decode(
                "completed order without capture id".to_string(),
            ))
        })?;
        let now = Utc::now();

        let txn = db::begin(&self.db_pool).await?;
        let result = async {
            let updated = PaymentEntity::update_many()
                .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Completed))
                .col_expr(payment::Column::CaptureId, Expr::value(capture_id.clone()))
                .col_expr(payment::Column::PaidAt, Expr::value(now))
                .col_expr(payment::Column::UpdatedAt, Expr::value(now))
                .filter(payment::Column::Id.eq(payment.id))
                .filter(
                    payment::Column::Status
                        .is_in([PaymentStatus::Pending, PaymentStatus::Cancelled]),
                )
                .filter(payment::Column::CaptureId.is_null())
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                return Ok::<_, ServiceError>(None);
            }
            let mark = self
                .orders
                .mark_paid_in_txn(&txn, payment.order_id, payment.amount)
                .await?;
            Ok(Some(mark))
        }
        .await;
        let mark = db::finish(txn, result).await?;

        let current = Self::load(&*self.db_pool, payment.id).await?;
        let Some(mark) = mark else {
            info!(payment_id = %payment.id, "payment already completed by a concurrent path");
            return Ok((current, false));
        };

        crate::metrics::PAYMENTS_COMPLETED.inc();
        info!(payment_id = %current.id, %capture_id, "payment completed");
        if let Some(captured) = state.captured_amount {
            if captured.round_dp(2) != current.amount.round_dp(2) {
                crate::metrics::INVARIANT_VIOLATIONS.inc();
                error!(invariant = true, payment_id = %current.id, %captured, expected = %current.amount, "captured amount differs from order total");
            }
        }
        self.publish(Event::PaymentCompleted {
            payment_id: current.id,
            order_id: current.order_id,
        })
        .await;

        match mark {
            MarkPaid::Transitioned => {
                self.publish(Event::OrderStatusChanged {
                    order_id: current.order_id,
                    old_status: OrderStatus::Pending.to_string(),
                    new_status: OrderStatus::Paid.to_string(),
                })
                .await;
            }
            MarkPaid::Unchanged(OrderStatus::Paid) => {}
            MarkPaid::AmountMismatch { total } => {
                crate::metrics::INVARIANT_VIOLATIONS.inc();
                error!(
                    invariant = true,
                    payment_id = %current.id,
                    order_id = %current.order_id,
                    paid = %current.amount,
                    %total,
                    "payment captured for a stale order total, order left unpaid, refund required"
                );
                return Ok((current, true));
            }
            MarkPaid::Unchanged(status) => {
                crate::metrics::INVARIANT_VIOLATIONS.inc();
                error!(
                    invariant = true,
                    payment_id = %current.id,
                    order_id = %current.order_id,
                    order_status = %status,
                    "payment captured for an order that can no longer be paid, refund required"
                );
            }
        }

        let order = self
            .orders
            .find_order(&*self.db_pool, current.order_id)
            .await?;
        self.send_invoice(&current, &order).await;
        Ok((current, true))
    }

    async fn fail_payment(&self, payment: payment::Model) -> Result<payment::Model, ServiceError> {
        let result = PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&*self.db_pool)
            .await?;

        if result.rows_affected == 1 {
            crate::metrics::PAYMENTS_FAILED.inc();
            warn!(payment_id = %payment.id, "payment declined by gateway");
            self.publish(Event::PaymentFailed {
                payment_id: payment.id,
                order_id: payment.order_id,
            })
            .await;
        }
        Self::load(&*self.db_pool, payment.id).await
    }

    async fn send_invoice(&self, payment: &payment::Model, order: &order::Model) {
        let user = match self.users.find(order.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user_id = %order.user_id, "no contact for invoice");
                return;
            }
            Err(e) => {
                warn!(error = %e, "user lookup for invoice failed");
                return;
            }
        };
        if let Err(e) = self.notifier.send_invoice(payment, order, &user).await {
            warn!(payment_id = %payment.id, error = %e, "invoice notification failed");
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}
