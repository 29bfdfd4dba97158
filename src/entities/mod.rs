pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod otp_code;
pub mod payment;
pub mod product;
pub mod return_request;
pub mod user;
pub mod webhook_event;

pub use order::OrderStatus;
pub use payment::PaymentStatus;
pub use return_request::{RefundStatus, ReturnStatus};
pub use webhook_event::WebhookEventStatus;
