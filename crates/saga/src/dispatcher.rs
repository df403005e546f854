//! Outbox event dispatcher.

use std::time::Duration;

use outbox::{OutboxEvent, OutboxStatus, OutboxStore};

use crate::broker::MessageBroker;
use crate::error::Result;

/// Publishes outbox rows to the broker and resolves their status.
///
/// A publish is attempted up to `max_attempts` times with a fixed delay.
/// On ack the row moves to `Success`; on exhaustion it moves to `Fail` and
/// the call still returns `Ok` — delivery failure is recorded for the
/// poller, never thrown into the caller's request path.
#[derive(Clone)]
pub struct EventDispatcher<B, X>
where
    B: MessageBroker,
    X: OutboxStore,
{
    broker: B,
    outbox: X,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<B, X> EventDispatcher<B, X>
where
    B: MessageBroker,
    X: OutboxStore,
{
    /// Creates a dispatcher with the default budget: 3 attempts, 1s apart.
    pub fn new(broker: B, outbox: X) -> Self {
        Self {
            broker,
            outbox,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Overrides the retry budget. Tests use a short delay.
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Publishes one outbox event, resolving its row status.
    ///
    /// Returns `true` if the broker acked within the budget.
    #[tracing::instrument(skip(self, event), fields(aggregate_id = %event.aggregate_id, topic = %event.event_type))]
    pub async fn publish(&self, event: &OutboxEvent) -> Result<bool> {
        let topic = event.event_type.topic();

        for attempt in 1..=self.max_attempts {
            match self
                .broker
                .publish(topic, &event.aggregate_id, &event.payload)
                .await
            {
                Ok(()) => {
                    self.outbox
                        .update_status(&event.aggregate_id, event.event_type, OutboxStatus::Success)
                        .await?;
                    metrics::counter!("dispatcher_published").increment(1);
                    return Ok(true);
                }
                Err(error) => {
                    tracing::warn!(%error, attempt, "publish attempt failed");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.outbox
            .update_status(&event.aggregate_id, event.event_type, OutboxStatus::Fail)
            .await?;
        metrics::counter!("dispatcher_exhausted").increment(1);
        tracing::warn!("publish budget exhausted; event marked FAIL");
        Ok(false)
    }
}
