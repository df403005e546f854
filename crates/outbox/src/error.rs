use thiserror::Error;

use crate::event::{EventType, OutboxStatus};

/// Errors that can occur when interacting with the outbox store.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A status update violated the monotonic status machine.
    #[error(
        "Invalid status transition for ({aggregate_id}, {event_type}): {from} -> {to}"
    )]
    InvalidTransition {
        aggregate_id: String,
        event_type: EventType,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    /// No row exists for the given idempotency key.
    #[error("Outbox event not found: ({aggregate_id}, {event_type})")]
    EventNotFound {
        aggregate_id: String,
        event_type: EventType,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
