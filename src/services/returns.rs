use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::{self, DbPool},
    entities::{
        order::{Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        return_request::{self, Entity as ReturnEntity, RefundStatus, ReturnStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        gateway::{GatewayError, PaymentGateway, RemoteRefundStatus},
        orders::OrderLifecycle,
        payments::PaymentReconciler,
        stock_ledger::StockLedger,
    },
};

/// A `processing` refund claim older than this is considered abandoned.
const STALE_REFUND_CLAIM_MINUTES: i64 = 10;

/// The return id, suffixed with the attempt number once the gateway has
/// refused an earlier attempt.
fn idempotency_key(ret: &return_request::Model) -> String {
    if ret.refund_attempt == 0 {
        ret.id.to_string()
    } else {
        format!("{}-{}", ret.id, ret.refund_attempt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReturnRequest {
    pub order_item_id: Uuid,
    #[validate(length(min = 1, max = 1000, message = "Reason must be between 1 and 1000 characters"))]
    pub reason: String,
}

/// Return requests and the partial refunds behind them.
///
/// A refund is claimed (`refund_status -> processing`) by a conditional
/// update before the gateway is called, so concurrent approvals of the same
/// return reach the gateway once. The return id doubles as the gateway's
/// idempotency key, which makes retrying a refund with an unknown outcome
/// safe.
pub struct ReturnRefundProcessor {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    payments: Arc<PaymentReconciler>,
    stock: StockLedger,
    return_window: Duration,
    event_sender: Option<Arc<EventSender>>,
}

impl ReturnRefundProcessor {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        payments: Arc<PaymentReconciler>,
        return_window: Duration,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            payments,
            stock: StockLedger::new(),
            return_window,
            event_sender,
        }
    }

    #[instrument(skip(self, reason))]
    pub async fn request_return(
        &self,
        user_id: Uuid,
        order_item_id: Uuid,
        reason: &str,
    ) -> Result<return_request::Model, ServiceError> {
        let reason = reason.trim();
        ReturnRequest {
            order_item_id,
            reason: reason.to_string(),
        }
        .validate()
        .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let db = &*self.db_pool;
        let not_found = || ServiceError::NotFound(format!("Order item {} not found", order_item_id));
        let item = OrderItemEntity::find_by_id(order_item_id)
            .one(db)
            .await?
            .ok_or_else(not_found)?;
        let order = OrderEntity::find_by_id(item.order_id)
            .one(db)
            .await?
            .filter(|order| order.user_id == user_id)
            .ok_or_else(not_found)?;

        if Utc::now() - order.order_date > self.return_window {
            return Err(ServiceError::ReturnWindowExpired {
                order_id: order.id,
                window_days: self.return_window.num_days(),
            });
        }
        if !matches!(order.status, OrderStatus::Paid | OrderStatus::Delivered) {
            return Err(ServiceError::OrderNotReturnable {
                order_id: order.id,
                status: order.status.to_string(),
            });
        }

        let active = ReturnEntity::find()
            .filter(return_request::Column::OrderItemId.eq(order_item_id))
            .filter(return_request::Column::Status.ne(ReturnStatus::Cancelled))
            .one(db)
            .await?;
        if active.is_some() {
            return Err(ServiceError::DuplicateReturn(order_item_id));
        }

        let now = Utc::now();
        let created = return_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_item_id: Set(order_item_id),
            order_id: Set(order.id),
            user_id: Set(user_id),
            reason: Set(reason.to_string()),
            status: Set(ReturnStatus::Pending),
            refund_id: Set(None),
            refund_amount: Set(None),
            refunded_at: Set(None),
            refund_status: Set(RefundStatus::Pending),
            refund_error: Set(None),
            refund_attempt: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .map_err(|e| {
            if db::is_unique_violation(&e) {
                ServiceError::DuplicateReturn(order_item_id)
            } else {
                e.into()
            }
        })?;

        self.publish(Event::ReturnRequested {
            return_id: created.id,
            order_item_id,
        })
        .await;
        info!(return_id = %created.id, %order_item_id, "return requested");
        Ok(created)
    }

    /// Refunds the returned line (`price * quantity`) against the order's
    /// capture. Stock and payment accounting are booked once the gateway
    /// reports the refund completed; a refund it is still settling is
    /// recorded as `submitted` and settled later by `settle_refund`.
    #[instrument(skip(self))]
    pub async fn process_refund(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        let db = &*self.db_pool;
        let ret = Self::load(db, return_id).await?;
        if ret.refund_status == RefundStatus::Submitted {
            return self.settle_refund(return_id).await;
        }
        Self::ensure_refundable(&ret)?;

        let item = OrderItemEntity::find_by_id(ret.order_item_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order item {} not found", ret.order_item_id))
            })?;
        let payment = self
            .payments
            .captured_payment_for_order(db, ret.order_id)
            .await?
            .ok_or(ServiceError::NoCompletedPayment(ret.order_id))?;
        let capture_id = payment
            .capture_id
            .clone()
            .ok_or(ServiceError::MissingCaptureId(payment.id))?;
        let amount = item.line_total();

        let ret = self.claim(&ret).await?;

        let note = format!("Return {} for order item {}", ret.id, ret.order_item_id);
        let refund = match self
            .gateway
            .refund(
                &capture_id,
                amount,
                &payment.currency,
                &note,
                &idempotency_key(&ret),
            )
            .await
        {
            Ok(refund) => refund,
            Err(e) => {
                // outcome may be unknown; the retry reuses the same key
                self.mark_failed(return_id, &e.to_string(), RefundStatus::Processing, false)
                    .await?;
                return Err(ServiceError::Gateway(e));
            }
        };

        let refund_status = match refund.status {
            RemoteRefundStatus::Completed => RefundStatus::Completed,
            RemoteRefundStatus::Pending | RemoteRefundStatus::Unknown => RefundStatus::Submitted,
            RemoteRefundStatus::Failed | RemoteRefundStatus::Cancelled => {
                let reason = format!(
                    "gateway reported refund {} as {:?}",
                    refund.refund_id, refund.status
                );
                self.mark_failed(return_id, &reason, RefundStatus::Processing, true)
                    .await?;
                return Err(ServiceError::Gateway(GatewayError::Rejected(reason)));
            }
        };

        let now = Utc::now();
        let txn = db::begin(&self.db_pool).await?;
        let result = async {
            let recorded = ReturnEntity::update_many()
                .col_expr(return_request::Column::RefundId, Expr::value(refund.refund_id.clone()))
                .col_expr(return_request::Column::RefundAmount, Expr::value(amount))
                .col_expr(return_request::Column::RefundStatus, Expr::value(refund_status))
                .col_expr(return_request::Column::RefundError, Expr::value(Option::<String>::None))
                .col_expr(return_request::Column::UpdatedAt, Expr::value(now))
                .filter(return_request::Column::Id.eq(return_id))
                .filter(return_request::Column::RefundStatus.eq(RefundStatus::Processing))
                // a stale-claim takeover restamps the row
                .filter(return_request::Column::UpdatedAt.eq(ret.updated_at))
                .exec(&txn)
                .await?;
            if recorded.rows_affected == 0 {
                return Err(ServiceError::RetryableConflict(format!(
                    "refund claim on return {} was taken over",
                    return_id
                )));
            }
            if refund_status == RefundStatus::Completed {
                self.book_refund(&txn, &ret, &item, payment.id, amount).await?;
            }
            Ok::<_, ServiceError>(())
        }
        .await;

        if let Err(e) = db::finish(txn, result).await {
            if let ServiceError::RetryableConflict(_) = e {
                // the caller that took over records the same refund by key
                warn!(%return_id, refund_id = %refund.refund_id, "refund claim taken over");
                return Err(e);
            }
            crate::metrics::INVARIANT_VIOLATIONS.inc();
            error!(
                invariant = true,
                %return_id,
                refund_id = %refund.refund_id,
                error = %e,
                "refund issued at gateway but not recorded"
            );
            // release the claim; a retry replays the same refund by key
            self.mark_failed(return_id, &e.to_string(), RefundStatus::Processing, false)
                .await?;
            return Err(e);
        }

        if refund_status == RefundStatus::Completed {
            self.refund_booked(return_id, &refund.refund_id, amount).await;
        } else {
            info!(%return_id, refund_id = %refund.refund_id, %amount, "refund submitted, awaiting settlement");
        }
        Self::load(db, return_id).await
    }

    /// Asks the gateway about a `submitted` refund. Completion books stock
    /// and accounting; a refusal reopens the return for another attempt.
    #[instrument(skip(self))]
    pub async fn settle_refund(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        let db = &*self.db_pool;
        let ret = Self::load(db, return_id).await?;
        if ret.refund_status != RefundStatus::Submitted {
            return Ok(ret);
        }
        let refund_id = ret.refund_id.clone().ok_or_else(|| {
            ServiceError::InvariantViolation(format!(
                "submitted refund on return {} has no refund id",
                return_id
            ))
        })?;

        let remote = self.gateway.fetch_refund(&refund_id).await?;
        match remote.status {
            RemoteRefundStatus::Pending | RemoteRefundStatus::Unknown => {
                info!(%return_id, %refund_id, "refund still settling");
                Ok(ret)
            }
            RemoteRefundStatus::Failed | RemoteRefundStatus::Cancelled => {
                let reason = format!("gateway reported refund {} as {:?}", refund_id, remote.status);
                self.mark_failed(return_id, &reason, RefundStatus::Submitted, true)
                    .await?;
                Err(ServiceError::Gateway(GatewayError::Rejected(reason)))
            }
            RemoteRefundStatus::Completed => {
                let item = OrderItemEntity::find_by_id(ret.order_item_id)
                    .one(db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!(
                            "Order item {} not found",
                            ret.order_item_id
                        ))
                    })?;
                let payment = self
                    .payments
                    .captured_payment_for_order(db, ret.order_id)
                    .await?
                    .ok_or(ServiceError::NoCompletedPayment(ret.order_id))?;
                let amount = ret.refund_amount.unwrap_or_else(|| item.line_total());

                let txn = db::begin(&self.db_pool).await?;
                let result = async {
                    let settled = ReturnEntity::update_many()
                        .col_expr(
                            return_request::Column::RefundStatus,
                            Expr::value(RefundStatus::Completed),
                        )
                        .col_expr(return_request::Column::RefundedAt, Expr::value(Utc::now()))
                        .col_expr(return_request::Column::UpdatedAt, Expr::value(Utc::now()))
                        .filter(return_request::Column::Id.eq(return_id))
                        .filter(return_request::Column::RefundStatus.eq(RefundStatus::Submitted))
                        .exec(&txn)
                        .await?;
                    if settled.rows_affected == 0 {
                        return Ok::<_, ServiceError>(false);
                    }
                    self.book_refund(&txn, &ret, &item, payment.id, amount).await?;
                    Ok(true)
                }
                .await;
                if db::finish(txn, result).await? {
                    self.refund_booked(return_id, &refund_id, amount).await;
                }
                Self::load(db, return_id).await
            }
        }
    }

    /// Settles every `submitted` refund once. Returns how many completed.
    pub async fn settle_submitted_refunds(&self) -> Result<usize, ServiceError> {
        let submitted = ReturnEntity::find()
            .filter(return_request::Column::RefundStatus.eq(RefundStatus::Submitted))
            .order_by_asc(return_request::Column::UpdatedAt)
            .all(&*self.db_pool)
            .await?;

        let mut completed = 0;
        for ret in submitted {
            match self.settle_refund(ret.id).await {
                Ok(settled) if settled.refund_status == RefundStatus::Completed => completed += 1,
                Ok(_) => {}
                Err(e) => warn!(return_id = %ret.id, error = %e, "refund settlement failed"),
            }
        }
        Ok(completed)
    }

    /// Polls `settle_submitted_refunds` until the task is aborted.
    pub fn start_settlement_worker(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match self.settle_submitted_refunds().await {
                    Ok(0) => {}
                    Ok(n) => info!(settled = n, "submitted refunds settled"),
                    Err(e) => warn!(error = %e, "refund settlement pass failed"),
                }
            }
        })
    }

    /// Moves a return to `approved`, `rejected` or `cancelled`. Approval
    /// only sticks once the refund has completed.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        return_id: Uuid,
        new_status: ReturnStatus,
    ) -> Result<return_request::Model, ServiceError> {
        let ret = Self::load(&*self.db_pool, return_id).await?;
        if ret.status == new_status && new_status.is_terminal() {
            return Ok(ret);
        }

        let updated = match new_status {
            ReturnStatus::Cancelled => return self.cancel_return(return_id).await,
            ReturnStatus::Pending => {
                return Err(Self::invalid(ret.status, new_status));
            }
            ReturnStatus::Approved => {
                if ret.status != ReturnStatus::Pending {
                    return Err(Self::invalid(ret.status, new_status));
                }
                let refunded = match self.process_refund(return_id).await {
                    Ok(refunded) => refunded,
                    Err(ServiceError::AlreadyRefunded(_)) => {
                        Self::load(&*self.db_pool, return_id).await?
                    }
                    Err(e) => {
                        warn!(%return_id, error = %e, "approval aborted, refund did not go through");
                        return Err(ServiceError::RefundProcessing(Box::new(e)));
                    }
                };
                if refunded.refund_status != RefundStatus::Completed {
                    warn!(%return_id, refund_status = %refunded.refund_status, "approval deferred until the refund settles");
                    return Err(ServiceError::RefundProcessing(Box::new(
                        ServiceError::RetryableConflict(format!(
                            "refund for return {} is {}",
                            return_id, refunded.refund_status
                        )),
                    )));
                }
                self.transition(&ret, ReturnStatus::Approved, &[RefundStatus::Completed])
                    .await?
            }
            ReturnStatus::Rejected => {
                if ret.status != ReturnStatus::Pending {
                    return Err(Self::invalid(ret.status, new_status));
                }
                Self::ensure_undecided(&ret)?;
                self.transition(&ret, ReturnStatus::Rejected, &RefundStatus::claimable())
                    .await?
            }
        };

        self.publish(Event::ReturnStatusChanged {
            return_id,
            old_status: ret.status.to_string(),
            new_status: updated.status.to_string(),
        })
        .await;
        info!(%return_id, old = %ret.status, new = %updated.status, "return status changed");
        Ok(updated)
    }

    /// User-initiated withdrawal of a pending return. Cancelling twice is
    /// harmless.
    #[instrument(skip(self))]
    pub async fn cancel_return(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        let ret = Self::load(&*self.db_pool, return_id).await?;
        if ret.refund_status.is_issued() {
            return Err(ServiceError::AlreadyRefunded(return_id));
        }
        match ret.status {
            ReturnStatus::Cancelled => return Ok(ret),
            ReturnStatus::Approved | ReturnStatus::Rejected => {
                return Err(Self::invalid(ret.status, ReturnStatus::Cancelled))
            }
            ReturnStatus::Pending => {}
        }
        Self::ensure_undecided(&ret)?;

        let updated = self
            .transition(&ret, ReturnStatus::Cancelled, &RefundStatus::claimable())
            .await?;
        self.publish(Event::ReturnStatusChanged {
            return_id,
            old_status: ret.status.to_string(),
            new_status: updated.status.to_string(),
        })
        .await;
        info!(%return_id, "return cancelled");
        Ok(updated)
    }

    pub async fn get_return(&self, return_id: Uuid) -> Result<return_request::Model, ServiceError> {
        Self::load(&*self.db_pool, return_id).await
    }

    pub async fn list_returns_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<return_request::Model>, ServiceError> {
        let returns = ReturnEntity::find()
            .filter(return_request::Column::UserId.eq(user_id))
            .order_by_desc(return_request::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?;
        Ok(returns)
    }

    async fn load<C: ConnectionTrait>(
        conn: &C,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        ReturnEntity::find_by_id(return_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", return_id)))
    }

    fn invalid(from: ReturnStatus, to: ReturnStatus) -> ServiceError {
        ServiceError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn ensure_refundable(ret: &return_request::Model) -> Result<(), ServiceError> {
        if matches!(ret.status, ReturnStatus::Rejected | ReturnStatus::Cancelled) {
            return Err(ServiceError::InvalidTransition {
                from: ret.status.to_string(),
                to: "refunded".to_string(),
            });
        }
        if ret.refund_status.is_issued() {
            return Err(ServiceError::AlreadyRefunded(ret.id));
        }
        Ok(())
    }

    fn ensure_undecided(ret: &return_request::Model) -> Result<(), ServiceError> {
        match ret.refund_status {
            status if status.is_issued() => Err(ServiceError::AlreadyRefunded(ret.id)),
            RefundStatus::Processing => Err(ServiceError::RetryableConflict(format!(
                "refund for return {} is in progress",
                ret.id
            ))),
            _ => Ok(()),
        }
    }

    /// Takes the refund claim. A `processing` claim older than
    /// `STALE_REFUND_CLAIM_MINUTES` belongs to a caller that died mid-refund
    /// and may be taken over.
    async fn claim(
        &self,
        ret: &return_request::Model,
    ) -> Result<return_request::Model, ServiceError> {
        let stale_before = Utc::now() - Duration::minutes(STALE_REFUND_CLAIM_MINUTES);
        let claimed = ReturnEntity::update_many()
            .col_expr(
                return_request::Column::RefundStatus,
                Expr::value(RefundStatus::Processing),
            )
            .col_expr(return_request::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(return_request::Column::Id.eq(ret.id))
            .filter(
                Condition::any()
                    .add(return_request::Column::RefundStatus.is_in(RefundStatus::claimable()))
                    .add(
                        Condition::all()
                            .add(return_request::Column::RefundStatus.eq(RefundStatus::Processing))
                            .add(return_request::Column::UpdatedAt.lt(stale_before)),
                    ),
            )
            .filter(
                return_request::Column::Status
                    .is_not_in([ReturnStatus::Rejected, ReturnStatus::Cancelled]),
            )
            .exec(&*self.db_pool)
            .await?;

        let current = Self::load(&*self.db_pool, ret.id).await?;
        if claimed.rows_affected == 1 {
            if ret.refund_status == RefundStatus::Processing {
                warn!(return_id = %ret.id, "took over a stale refund claim");
            }
            return Ok(current);
        }

        Self::ensure_refundable(&current)?;
        Err(ServiceError::RetryableConflict(format!(
            "refund for return {} is already in progress",
            ret.id
        )))
    }

    /// Moves the refund from `from` to `failed`. `refused` marks a
    /// definitive gateway refusal, after which the next attempt needs a new
    /// idempotency key.
    async fn mark_failed(
        &self,
        return_id: Uuid,
        reason: &str,
        from: RefundStatus,
        refused: bool,
    ) -> Result<(), ServiceError> {
        let mut update = ReturnEntity::update_many()
            .col_expr(return_request::Column::RefundStatus, Expr::value(RefundStatus::Failed))
            .col_expr(return_request::Column::RefundError, Expr::value(reason.to_string()))
            .col_expr(return_request::Column::UpdatedAt, Expr::value(Utc::now()));
        if refused {
            update = update.col_expr(
                return_request::Column::RefundAttempt,
                Expr::col(return_request::Column::RefundAttempt).add(1),
            );
        }
        update
            .filter(return_request::Column::Id.eq(return_id))
            .filter(return_request::Column::RefundStatus.eq(from))
            .exec(&*self.db_pool)
            .await?;

        crate::metrics::REFUNDS_FAILED.inc();
        warn!(%return_id, %reason, refused, "refund failed");
        self.publish(Event::RefundFailed {
            return_id,
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    /// Stock and payment side of a completed refund, inside the caller's
    /// transaction. A cancelled order already had its stock returned.
    async fn book_refund(
        &self,
        txn: &DatabaseTransaction,
        ret: &return_request::Model,
        item: &order_item::Model,
        payment_id: Uuid,
        amount: Decimal,
    ) -> Result<(), ServiceError> {
        if OrderLifecycle::touch_unless_cancelled(txn, ret.order_id).await? {
            self.stock.release(txn, item.product_id, item.quantity).await?;
        } else {
            info!(return_id = %ret.id, order_id = %ret.order_id, "order cancelled, stock already returned");
        }
        ReturnEntity::update_many()
            .col_expr(return_request::Column::RefundedAt, Expr::value(Utc::now()))
            .filter(return_request::Column::Id.eq(ret.id))
            .exec(txn)
            .await?;
        self.payments.apply_refund(txn, payment_id, amount).await?;
        Ok(())
    }

    async fn refund_booked(&self, return_id: Uuid, refund_id: &str, amount: Decimal) {
        crate::metrics::REFUNDS_ISSUED.inc();
        self.publish(Event::RefundIssued {
            return_id,
            refund_id: refund_id.to_string(),
            amount,
        })
        .await;
        info!(%return_id, %refund_id, %amount, "refund issued");
    }

    /// Conditional `pending -> to`, optionally also requiring the refund to
    /// be in one of `refund_states`.
    async fn transition(
        &self,
        ret: &return_request::Model,
        to: ReturnStatus,
        refund_states: &[RefundStatus],
    ) -> Result<return_request::Model, ServiceError> {
        let mut update = ReturnEntity::update_many()
            .col_expr(return_request::Column::Status, Expr::value(to))
            .col_expr(return_request::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(return_request::Column::Id.eq(ret.id))
            .filter(return_request::Column::Status.eq(ReturnStatus::Pending));
        if !refund_states.is_empty() {
            update = update
                .filter(return_request::Column::RefundStatus.is_in(refund_states.iter().copied()));
        }
        let result = update.exec(&*self.db_pool).await?;

        let current = Self::load(&*self.db_pool, ret.id).await?;
        if result.rows_affected == 1 || current.status == to {
            return Ok(current);
        }
        if current.status != ReturnStatus::Pending {
            return Err(Self::invalid(current.status, to));
        }
        Self::ensure_undecided(&current)?;
        Err(ServiceError::RetryableConflict(format!(
            "return {} changed concurrently",
            ret.id
        )))
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}
