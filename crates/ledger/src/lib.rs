//! Resource ledgers for the order saga.
//!
//! Two resource managers with two concurrency-control strategies:
//!
//! - [`StockLedger`] — pessimistic. Batch deductions take exclusive per-row
//!   locks in sorted product order and apply all-or-nothing.
//! - [`WalletLedger`] — optimistic. Mutations are compare-and-swap on the
//!   wallet `version`; a lost race surfaces as a conflict for the caller to
//!   handle. Every successful mutation appends one [`Point`] audit row.

pub mod error;
pub mod postgres;
pub mod stock;
pub mod wallet;

pub use error::{LedgerError, Result};
pub use postgres::{PostgresStockLedger, PostgresWalletLedger};
pub use stock::{InMemoryStockLedger, ProductStock, StockLedger};
pub use wallet::{InMemoryWalletLedger, Point, PointId, TransactionType, Wallet, WalletLedger};
