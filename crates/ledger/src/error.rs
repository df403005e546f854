use common::{ProductId, UserId, WalletId};
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The product has no stock row.
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// Requested more units than are available. Fails the whole batch.
    #[error("Out of stock for {product_id}: requested {requested}, available {available}")]
    OutOfStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// The user has no wallet.
    #[error("Wallet not found for user: {0}")]
    WalletNotFound(UserId),

    /// The wallet balance cannot cover the requested amount.
    #[error("Insufficient balance in wallet {wallet_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        wallet_id: WalletId,
        available: i64,
        requested: i64,
    },

    /// A concurrent writer won the race; the read version is stale.
    /// Retrying is the caller's decision, never the ledger's.
    #[error("Version conflict on wallet {wallet_id}: expected version {expected}")]
    VersionConflict { wallet_id: WalletId, expected: i64 },

    /// The mutation amount is not positive.
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// Returns true for errors in the conflict class: the request was
    /// well-formed but lost against the current state of a shared resource.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LedgerError::OutOfStock { .. }
                | LedgerError::InsufficientBalance { .. }
                | LedgerError::VersionConflict { .. }
        )
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
