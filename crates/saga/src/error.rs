//! Saga error types.

use ledger::LedgerError;
use orders::OrderError;
use outbox::OutboxError;
use thiserror::Error;

use crate::broker::BrokerError;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Order store error.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Stock or wallet ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Outbox store error.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Message broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classification of a saga error, driving propagation and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A referenced entity does not exist.
    NotFound,
    /// The request lost against the current state of a shared resource
    /// (out of stock, insufficient balance, stale version).
    Conflict,
    /// Infrastructure hiccup worth retrying (broker unavailable).
    Transient,
    /// Unexpected and unrecoverable; logged and left to compensation.
    Fatal,
}

impl SagaError {
    /// Classifies this error into the saga failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            SagaError::Order(OrderError::UserNotFound(_))
            | SagaError::Order(OrderError::OrderNotFound(_))
            | SagaError::Ledger(LedgerError::ProductNotFound(_))
            | SagaError::Ledger(LedgerError::WalletNotFound(_)) => FailureKind::NotFound,

            SagaError::Order(OrderError::AlreadyExists(_)) => FailureKind::Conflict,
            SagaError::Ledger(error) if error.is_conflict() => FailureKind::Conflict,

            SagaError::Broker(_) => FailureKind::Transient,

            _ => FailureKind::Fatal,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
