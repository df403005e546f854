use common::{OrderId, UserId};
use thiserror::Error;

/// Errors that can occur during order store operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The user placing the order does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// The order does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// An order already exists with this ID.
    #[error("Order already exists: {0}")]
    AlreadyExists(OrderId),

    /// An order must carry at least one item.
    #[error("Order has no items")]
    EmptyOrder,

    /// Item quantity must be positive.
    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: String, quantity: u32 },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for order store operations.
pub type Result<T> = std::result::Result<T, OrderError>;
