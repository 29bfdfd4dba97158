//! Stock ledger over `products.stock`.
//!
//! Every movement is a single conditional `UPDATE`; the row count tells the
//! caller whether it won. No read-then-write and no process-local locks.

use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect,
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    entities::product::{self, Entity as ProductEntity},
    errors::ServiceError,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct StockLedger;

impl StockLedger {
    pub fn new() -> Self {
        Self
    }

    /// Takes `quantity` units if at least that many remain.
    ///
    /// Returns `false` when stock is short or the product is gone; nothing is
    /// changed in that case.
    pub async fn reserve<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<bool, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be at least 1, got {}",
                quantity
            )));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(
                product::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        let reserved = result.rows_affected == 1;
        if !reserved {
            crate::metrics::STOCK_RESERVATIONS_REJECTED.inc();
        }
        debug!(%product_id, quantity, reserved, "stock reservation");
        Ok(reserved)
    }

    /// Returns `quantity` units taken by an earlier reservation.
    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be at least 1, got {}",
                quantity
            )));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(
                product::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected != 1 {
            crate::metrics::INVARIANT_VIOLATIONS.inc();
            error!(invariant = true, %product_id, quantity, "stock release found no product row");
            return Err(ServiceError::InvariantViolation(format!(
                "cannot release {} units to missing product {}",
                quantity, product_id
            )));
        }

        debug!(%product_id, quantity, "stock released");
        Ok(())
    }

    /// Current units on hand, `None` if the product does not exist.
    pub async fn available<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
    ) -> Result<Option<i32>, ServiceError> {
        let stock = ProductEntity::find_by_id(product_id)
            .select_only()
            .column(product::Column::Stock)
            .into_tuple::<i32>()
            .one(conn)
            .await?;
        Ok(stock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_pool;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sea_orm::{ActiveModelTrait, Set};

    async fn seed_product(pool: &crate::db::DbPool, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set("Widget".into()),
            price: Set(dec!(10.00)),
            stock: Set(stock),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(pool)
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn reserve_takes_stock_only_when_enough_remains() {
        let pool = memory_pool().await;
        let ledger = StockLedger::new();
        let id = seed_product(&pool, 3).await;

        assert!(ledger.reserve(&pool, id, 2).await.unwrap());
        assert!(!ledger.reserve(&pool, id, 2).await.unwrap());
        assert_eq!(ledger.available(&pool, id).await.unwrap(), Some(1));
        assert!(ledger.reserve(&pool, id, 1).await.unwrap());
        assert_eq!(ledger.available(&pool, id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn release_restores_and_rejects_unknown_product() {
        let pool = memory_pool().await;
        let ledger = StockLedger::new();
        let id = seed_product(&pool, 0).await;

        ledger.release(&pool, id, 4).await.unwrap();
        assert_eq!(ledger.available(&pool, id).await.unwrap(), Some(4));

        let err = ledger.release(&pool, Uuid::new_v4(), 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn reserve_on_missing_product_is_a_plain_refusal() {
        let pool = memory_pool().await;
        let reserved = StockLedger::new()
            .reserve(&pool, Uuid::new_v4(), 1)
            .await
            .unwrap();
        assert!(!reserved);
    }

    #[tokio::test]
    async fn non_positive_quantities_are_rejected() {
        let pool = memory_pool().await;
        let id = seed_product(&pool, 5).await;
        let err = StockLedger::new().reserve(&pool, id, 0).await.unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
