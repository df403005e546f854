//! Shared identifier types used across the order saga workspace.

mod types;

pub use types::{OrderId, ProductId, UserId, WalletId};
