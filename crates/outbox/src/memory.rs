use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    EventType, OutboxError, OutboxEvent, OutboxStatus, Result,
    store::{Append, OutboxStore},
};

/// In-memory outbox store.
///
/// Rows are kept in insertion order so `list_by_status` feeds the poller
/// oldest-first, matching the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    rows: Arc<RwLock<Vec<OutboxEvent>>>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty in-memory outbox store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of rows stored.
    pub async fn event_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Clears all rows.
    pub async fn clear(&self) {
        self.rows.write().await.clear();
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Append> {
        let mut rows = self.rows.write().await;

        if let Some(existing) = rows
            .iter()
            .find(|row| row.aggregate_id == aggregate_id && row.event_type == event_type)
        {
            if existing.status != OutboxStatus::Init {
                metrics::counter!("outbox_append_skipped").increment(1);
                return Ok(Append::AlreadyResolved(existing.clone()));
            }
            return Ok(Append::Recorded(existing.clone()));
        }

        let event = OutboxEvent::new(aggregate_id, event_type, payload);
        rows.push(event.clone());
        metrics::counter!("outbox_append_recorded").increment(1);
        Ok(Append::Recorded(event))
    }

    async fn update_status(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        status: OutboxStatus,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;

        let row = rows
            .iter_mut()
            .find(|row| row.aggregate_id == aggregate_id && row.event_type == event_type)
            .ok_or_else(|| OutboxError::EventNotFound {
                aggregate_id: aggregate_id.to_string(),
                event_type,
            })?;

        if row.status == status {
            return Ok(());
        }
        if !row.status.can_transition_to(status) {
            return Err(OutboxError::InvalidTransition {
                aggregate_id: aggregate_id.to_string(),
                event_type,
                from: row.status,
                to: status,
            });
        }

        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn find(
        &self,
        aggregate_id: &str,
        event_type: EventType,
    ) -> Result<Option<OutboxEvent>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|row| row.aggregate_id == aggregate_id && row.event_type == event_type)
            .cloned())
    }

    async fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|row| row.status == status).cloned().collect())
    }

    async fn list_for_aggregate(&self, aggregate_id: &str) -> Result<Vec<OutboxEvent>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|row| row.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }
}
