use async_trait::async_trait;

use crate::{EventType, OutboxEvent, OutboxStatus, Result};

/// Outcome of an [`OutboxStore::append`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Append {
    /// The event is pending publication — either freshly inserted, or an
    /// existing `Init` row for the same key (an in-flight retry).
    Recorded(OutboxEvent),

    /// A row for this key already resolved to a non-`Init` status; the
    /// append was an idempotent no-op and nothing will be re-published.
    AlreadyResolved(OutboxEvent),
}

impl Append {
    /// Returns the event regardless of outcome.
    pub fn event(&self) -> &OutboxEvent {
        match self {
            Append::Recorded(event) | Append::AlreadyResolved(event) => event,
        }
    }

    /// Returns true if the event is pending publication.
    pub fn is_recorded(&self) -> bool {
        matches!(self, Append::Recorded(_))
    }
}

/// Core trait for outbox store implementations.
///
/// All implementations must be thread-safe (Send + Sync). The
/// `(aggregate_id, event_type)` pair is the idempotency key: appending a
/// second time after the first record resolved must not create a duplicate
/// row or re-trigger publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Records the intent to publish an event.
    ///
    /// If a row already exists for the key and its status is not `Init`,
    /// the append is skipped and [`Append::AlreadyResolved`] is returned —
    /// this guards against duplicate saga re-entry caused by retries.
    async fn append(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Append>;

    /// Updates the status of an existing row.
    ///
    /// Enforces the monotonic status machine: `Success` never changes, and
    /// `Fail` can only move to `Success`. Updating to the current status is
    /// a no-op. Used by the dispatcher and poller after publish attempts,
    /// outside any business transaction.
    async fn update_status(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        status: OutboxStatus,
    ) -> Result<()>;

    /// Fetches a single row by its idempotency key.
    async fn find(
        &self,
        aggregate_id: &str,
        event_type: EventType,
    ) -> Result<Option<OutboxEvent>>;

    /// Lists all rows with the given status, oldest first.
    async fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>>;

    /// Lists all rows for one aggregate, oldest first.
    async fn list_for_aggregate(&self, aggregate_id: &str) -> Result<Vec<OutboxEvent>>;
}
