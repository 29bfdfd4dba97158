//! Narrow contracts to the parts of the shop this core does not own:
//! carts, the product catalog, user contact data and outbound mail.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::{cart_item, order, payment, product, user},
    errors::ServiceError,
    events::{Event, EventSender},
    services::otp::OneTimeCode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Catalog view of a product at the moment of reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSnapshot {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContact {
    pub id: Uuid,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct OtpDelivery {
    pub user_id: Uuid,
    pub purpose: String,
    pub destination: String,
    pub code: OneTimeCode,
}

/// Cart contents, read and cleared inside the checkout transaction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartSource: Send + Sync {
    async fn get_items(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
    ) -> Result<Vec<CartLine>, ServiceError>;

    async fn clear(&self, txn: &DatabaseTransaction, user_id: Uuid) -> Result<(), ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_by_id(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<Option<ProductSnapshot>, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn find(&self, user_id: Uuid) -> Result<Option<UserContact>, ServiceError>;
}

/// Outbound mail. Callers log failures and carry on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_invoice(
        &self,
        payment: &payment::Model,
        order: &order::Model,
        user: &UserContact,
    ) -> Result<(), ServiceError>;

    async fn send_otp(&self, delivery: &OtpDelivery) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DbCartSource;

#[async_trait]
impl CartSource for DbCartSource {
    async fn get_items(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
    ) -> Result<Vec<CartLine>, ServiceError> {
        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(txn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| CartLine {
                product_id: row.product_id,
                quantity: row.quantity,
            })
            .collect())
    }

    async fn clear(&self, txn: &DatabaseTransaction, user_id: Uuid) -> Result<(), ServiceError> {
        cart_item::Entity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(txn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DbProductCatalog;

#[async_trait]
impl ProductCatalog for DbProductCatalog {
    async fn get_by_id(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<Option<ProductSnapshot>, ServiceError> {
        let found = product::Entity::find_by_id(product_id).one(txn).await?;
        Ok(found.map(|p| ProductSnapshot {
            id: p.id,
            name: p.name,
            price: p.price,
            stock: p.stock,
        }))
    }
}

#[derive(Clone)]
pub struct DbUserLookup {
    db: Arc<DbPool>,
}

impl DbUserLookup {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserLookup for DbUserLookup {
    async fn find(&self, user_id: Uuid) -> Result<Option<UserContact>, ServiceError> {
        let found = user::Entity::find_by_id(user_id).one(&*self.db).await?;
        Ok(found.map(|u| UserContact {
            id: u.id,
            email: u.email,
            name: u.name,
        }))
    }
}

/// Hands mail to the event loop, which owns delivery.
#[derive(Clone)]
pub struct EventNotifier {
    events: Arc<EventSender>,
}

impl EventNotifier {
    pub fn new(events: Arc<EventSender>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn send_invoice(
        &self,
        payment: &payment::Model,
        order: &order::Model,
        user: &UserContact,
    ) -> Result<(), ServiceError> {
        self.events
            .send(Event::InvoiceRequested {
                payment_id: payment.id,
                order_id: order.id,
                order_number: order.order_number.clone(),
                email: user.email.clone(),
                amount: payment.amount,
            })
            .await
            .map_err(ServiceError::InternalError)
    }

    async fn send_otp(&self, delivery: &OtpDelivery) -> Result<(), ServiceError> {
        self.events
            .send(Event::OtpDeliveryRequested {
                user_id: delivery.user_id,
                purpose: delivery.purpose.clone(),
                destination: delivery.destination.clone(),
                code: delivery.code.clone(),
            })
            .await
            .map_err(ServiceError::InternalError)
    }
}
