use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::{self, DbPool},
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
        return_request::{self, Entity as ReturnEntity, RefundStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        collaborators::{CartLine, CartSource, ProductCatalog},
        stock_ledger::StockLedger,
    },
};

const ORDER_SUFFIX_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ORDER_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderLineRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Outcome of asking a pending order to become paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkPaid {
    Transitioned,
    Unchanged(OrderStatus),
    /// The payment does not cover the current order total
    AmountMismatch { total: Decimal },
}

/// A priced line whose stock is already taken, not yet inserted.
struct ReservedLine {
    item: order_item::ActiveModel,
    line_total: Decimal,
}

/// Owns the order aggregate: creation from a cart or an item list, item
/// additions while pending, status transitions and cancellation.
pub struct OrderLifecycle {
    db_pool: Arc<DbPool>,
    cart: Arc<dyn CartSource>,
    catalog: Arc<dyn ProductCatalog>,
    stock: StockLedger,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderLifecycle {
    pub fn new(
        db_pool: Arc<DbPool>,
        cart: Arc<dyn CartSource>,
        catalog: Arc<dyn ProductCatalog>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            cart,
            catalog,
            stock: StockLedger::new(),
            event_sender,
        }
    }

    /// Turns the user's cart into a pending order, re-priced from the
    /// catalog. Stock reservation, order insert and cart clearing commit
    /// together or not at all.
    #[instrument(skip(self))]
    pub async fn create_from_cart(&self, user_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result = self.checkout_cart_in_txn(&txn, user_id).await;
        let placed = db::finish(txn, result).await?;
        self.order_placed(&placed).await;
        Ok(placed)
    }

    /// Same as `create_from_cart` for an explicit item list; the cart is untouched.
    #[instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn create_from_items(
        &self,
        user_id: Uuid,
        items: Vec<OrderLineRequest>,
    ) -> Result<OrderWithItems, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "an order needs at least one item".to_string(),
            ));
        }
        for item in &items {
            item.validate()?;
        }
        let lines = items
            .into_iter()
            .map(|i| CartLine {
                product_id: i.product_id,
                quantity: i.quantity,
            })
            .collect();

        let txn = db::begin(&self.db_pool).await?;
        let result = self.place_in_txn(&txn, user_id, lines).await;
        let placed = db::finish(txn, result).await?;
        self.order_placed(&placed).await;
        Ok(placed)
    }

    /// Appends a line to a pending order owned by `user_id`.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<OrderWithItems, ServiceError> {
        OrderLineRequest {
            product_id,
            quantity,
        }
        .validate()?;

        let txn = db::begin(&self.db_pool).await?;
        let result = self
            .add_item_in_txn(&txn, user_id, order_id, product_id, quantity)
            .await;
        let updated = db::finish(txn, result).await?;

        self.publish(Event::OrderItemAdded {
            order_id,
            product_id,
            quantity,
        })
        .await;
        info!(%order_id, %product_id, quantity, total = %updated.order.total_amount, "order item added");
        Ok(updated)
    }

    /// Moves an order along the transition table. Cancellation goes through
    /// `cancel` so reserved stock comes back.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        if new_status == OrderStatus::Cancelled {
            if !self.cancel(order_id).await? {
                let current = self.find_order(&*self.db_pool, order_id).await?;
                return Err(ServiceError::InvalidTransition {
                    from: current.status.to_string(),
                    to: new_status.to_string(),
                });
            }
            return self.find_order(&*self.db_pool, order_id).await;
        }

        let db = &*self.db_pool;
        let current = self.find_order(db, order_id).await?;
        if !current.status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidTransition {
                from: current.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let result = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(current.status))
            .exec(db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        self.publish(Event::OrderStatusChanged {
            order_id,
            old_status: current.status.to_string(),
            new_status: new_status.to_string(),
        })
        .await;
        info!(%order_id, from = %current.status, to = %new_status, "order status updated");
        self.find_order(db, order_id).await
    }

    /// Cancels a pending or paid order and returns its stock.
    ///
    /// Returns `false` without side effects when the order is already
    /// cancelled or delivered.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result = self.cancel_in_txn(&txn, order_id).await;
        let cancelled = db::finish(txn, result).await?;

        if cancelled {
            crate::metrics::ORDERS_CANCELLED.inc();
            self.publish(Event::OrderCancelled(order_id)).await;
            info!(%order_id, "order cancelled");
        } else {
            info!(%order_id, "cancel ignored, order already final");
        }
        Ok(cancelled)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let db = &*self.db_pool;
        let order = self.find_order(db, order_id).await?;
        let items = Self::items_of(db, order_id).await?;
        Ok(OrderWithItems { order, items })
    }

    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<order::Model>, ServiceError> {
        let orders = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::OrderDate)
            .all(&*self.db_pool)
            .await?;
        Ok(orders)
    }

    /// Conditional `Pending|Paid -> Cancelled` inside the caller's
    /// transaction. Restores stock for every line and voids any pending
    /// payment so it can no longer be captured.
    pub(crate) async fn cancel_in_txn(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.is_in(OrderStatus::cancellable()))
            .exec(txn)
            .await?;

        if result.rows_affected == 0 {
            // distinguishes "already final" from "no such order"
            self.find_order(txn, order_id).await?;
            return Ok(false);
        }

        // lines refunded through a return already have their stock back
        let restocked: HashSet<Uuid> = ReturnEntity::find()
            .filter(return_request::Column::OrderId.eq(order_id))
            .filter(return_request::Column::RefundStatus.eq(RefundStatus::Completed))
            .all(txn)
            .await?
            .into_iter()
            .map(|ret| ret.order_item_id)
            .collect();

        for item in Self::items_of(txn, order_id).await? {
            if restocked.contains(&item.id) {
                info!(%order_id, order_item_id = %item.id, "line already restocked by its refund");
                continue;
            }
            self.stock
                .release(txn, item.product_id, item.quantity)
                .await?;
        }

        Self::void_pending_payments(txn, order_id).await?;
        Ok(true)
    }

    async fn void_pending_payments(
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = PaymentEntity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Cancelled))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(txn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Locks the order row for a refund being booked. Returns `false` when
    /// the order was cancelled, in which case its stock already came back.
    pub(crate) async fn touch_unless_cancelled<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Conditional `Pending -> Paid` inside the caller's transaction.
    pub(crate) async fn mark_paid_in_txn(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        paid_amount: Decimal,
    ) -> Result<MarkPaid, ServiceError> {
        let order = self.find_order(txn, order_id).await?;
        if order.status == OrderStatus::Pending
            && order.total_amount.round_dp(2) != paid_amount.round_dp(2)
        {
            return Ok(MarkPaid::AmountMismatch {
                total: order.total_amount,
            });
        }

        let result = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Paid))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(order.version))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(txn)
            .await?;

        if result.rows_affected == 1 {
            return Ok(MarkPaid::Transitioned);
        }
        let current = self.find_order(txn, order_id).await?;
        Ok(MarkPaid::Unchanged(current.status))
    }

    pub(crate) async fn find_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn items_of<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?;
        Ok(items)
    }

    async fn checkout_cart_in_txn(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
    ) -> Result<OrderWithItems, ServiceError> {
        let lines = self.cart.get_items(txn, user_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }
        let placed = self.place_in_txn(txn, user_id, lines).await?;
        self.cart.clear(txn, user_id).await?;
        Ok(placed)
    }

    async fn place_in_txn(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        lines: Vec<CartLine>,
    ) -> Result<OrderWithItems, ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let mut total = Decimal::ZERO;
        let mut items = Vec::new();

        for line in merge_lines(lines)? {
            let reserved = self
                .reserve_line(txn, order_id, line.product_id, line.quantity)
                .await?;
            total += reserved.line_total;
            items.push(reserved.item);
        }

        let order_number = generate_order_number();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            user_id: Set(user_id),
            total_amount: Set(total),
            status: Set(OrderStatus::Pending),
            order_date: Set(now),
            version: Set(1),
            updated_at: Set(now),
        }
        .insert(txn)
        .await
        .map_err(|e| {
            if db::is_unique_violation(&e) {
                warn!(%order_number, "order number collision");
                ServiceError::RetryableConflict(format!(
                    "order number {} already taken",
                    order_number
                ))
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;

        let mut saved = Vec::with_capacity(items.len());
        for item in items {
            saved.push(item.insert(txn).await?);
        }

        Ok(OrderWithItems {
            order,
            items: saved,
        })
    }

    /// Prices a line from the catalog and takes its stock.
    async fn reserve_line(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<ReservedLine, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for product {} must be at least 1",
                product_id
            )));
        }

        let product = self
            .catalog
            .get_by_id(txn, product_id)
            .await?
            .ok_or(ServiceError::ProductUnavailable(product_id))?;

        if quantity > product.stock {
            return Err(ServiceError::InsufficientStock {
                product_id,
                product_name: product.name,
                available: product.stock,
                requested: quantity,
            });
        }

        if !self.stock.reserve(txn, product_id, quantity).await? {
            let available = self
                .stock
                .available(txn, product_id)
                .await?
                .unwrap_or_default();
            return Err(ServiceError::InsufficientStock {
                product_id,
                product_name: product.name,
                available,
                requested: quantity,
            });
        }

        Ok(ReservedLine {
            line_total: product.price * Decimal::from(quantity),
            item: order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product_id),
                product_name: Set(product.name),
                price: Set(product.price),
                quantity: Set(quantity),
            },
        })
    }

    async fn add_item_in_txn(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<OrderWithItems, ServiceError> {
        let order = self.find_order(txn, order_id).await?;
        if order.user_id != user_id {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::OrderNotModifiable {
                order_id,
                status: order.status.to_string(),
            });
        }

        let item = self
            .reserve_line(txn, order_id, product_id, quantity)
            .await?
            .item
            .insert(txn)
            .await?;
        let new_total = order.total_amount + item.line_total();

        let result = OrderEntity::update_many()
            .col_expr(order::Column::TotalAmount, Expr::value(new_total))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(order.version))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        // an approval opened for the old total must not settle the new one
        let voided = Self::void_pending_payments(txn, order_id).await?;
        if voided > 0 {
            info!(%order_id, voided, "pending payment voided by item addition");
        }

        let order = self.find_order(txn, order_id).await?;
        let items = Self::items_of(txn, order_id).await?;
        let sum: Decimal = items.iter().map(|i| i.line_total()).sum();
        if sum.round_dp(4) != order.total_amount.round_dp(4) {
            crate::metrics::INVARIANT_VIOLATIONS.inc();
            error!(invariant = true, %order_id, %sum, total = %order.total_amount, "order total drifted from its items");
            return Err(ServiceError::InvariantViolation(format!(
                "order {} total {} does not match items {}",
                order_id, order.total_amount, sum
            )));
        }

        Ok(OrderWithItems { order, items })
    }

    async fn order_placed(&self, placed: &OrderWithItems) {
        crate::metrics::ORDERS_CREATED.inc();
        self.publish(Event::OrderCreated {
            order_id: placed.order.id,
            user_id: placed.order.user_id,
            total_amount: placed.order.total_amount,
        })
        .await;
        info!(
            order_id = %placed.order.id,
            order_number = %placed.order.order_number,
            total = %placed.order.total_amount,
            lines = placed.items.len(),
            "order created"
        );
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}

/// Folds repeated products into one line, keeping first-seen order.
fn merge_lines(lines: Vec<CartLine>) -> Result<Vec<CartLine>, ServiceError> {
    let mut merged: Vec<CartLine> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .checked_add(line.quantity)
                    .ok_or_else(|| {
                        ServiceError::ValidationError(format!(
                            "quantity for product {} is too large",
                            line.product_id
                        ))
                    })?;
            }
            None => merged.push(line),
        }
    }
    Ok(merged)
}

/// `ORD-<utc timestamp>-<6 random chars>`.
pub fn generate_order_number() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ORDER_SUFFIX_LEN)
        .map(|_| ORDER_SUFFIX_CHARSET[rng.gen_range(0..ORDER_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_number_format() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1].len(), 14);
        assert!(parts[1].bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(parts[2].len(), ORDER_SUFFIX_LEN);
        assert!(parts[2].bytes().all(|b| ORDER_SUFFIX_CHARSET.contains(&b)));
    }

    #[test]
    fn duplicate_products_are_merged() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_lines(vec![
            CartLine { product_id: a, quantity: 1 },
            CartLine { product_id: b, quantity: 2 },
            CartLine { product_id: a, quantity: 3 },
        ])
        .unwrap();
        assert_eq!(
            merged,
            vec![
                CartLine { product_id: a, quantity: 4 },
                CartLine { product_id: b, quantity: 2 },
            ]
        );
    }

    #[test]
    fn merging_huge_quantities_is_a_validation_error() {
        let a = Uuid::new_v4();
        let result = merge_lines(vec![
            CartLine { product_id: a, quantity: i32::MAX },
            CartLine { product_id: a, quantity: 1 },
        ]);
        assert!(matches!(result, Err(ServiceError::ValidationError(_))));
    }

    #[test]
    fn line_request_rejects_zero_quantity() {
        let line = OrderLineRequest {
            product_id: Uuid::new_v4(),
            quantity: 0,
        };
        assert!(line.validate().is_err());
    }
}
