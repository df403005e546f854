//! Message broker trait and in-memory implementation.
//!
//! The physical broker client is an external collaborator; this trait is
//! the seam it plugs into. Messages carry `key = aggregate_id`, so a real
//! broker partitions by order and preserves per-order delivery order. The
//! in-memory broker gets the same guarantee from one ordered channel per
//! topic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};

/// Errors a broker publish can produce.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached. Transient; callers retry with
    /// their own budget.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Topic name, e.g. `order.created`.
    pub topic: String,
    /// Partition key; always the aggregate ID.
    pub key: String,
    /// Canonical JSON payload.
    pub payload: serde_json::Value,
}

/// Trait for message broker implementations.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a payload to a topic, keyed for per-aggregate ordering.
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), BrokerError>;
}

#[derive(Default)]
struct BrokerInner {
    log: HashMap<String, Vec<Message>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    fail_remaining: u32,
}

/// In-memory broker for tests and single-process deployments.
///
/// Keeps a per-topic log of every published message and fans each message
/// out to topic subscribers in publish order. `fail_next_publishes` injects
/// transient failures to exercise retry budgets.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<RwLock<BrokerInner>>,
}

impl InMemoryBroker {
    /// Creates a new in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a topic; the receiver sees messages in publish order.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        inner.subscribers.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Makes the next `count` publishes fail with `Unavailable`.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.inner.write().await.fail_remaining = count;
    }

    /// Returns every message published to a topic so far.
    pub async fn published(&self, topic: &str) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner.log.get(topic).cloned().unwrap_or_default()
    }

    /// Returns how many messages were published to a topic.
    pub async fn published_count(&self, topic: &str) -> usize {
        let inner = self.inner.read().await;
        inner.log.get(topic).map_or(0, Vec::len)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), BrokerError> {
        let mut inner = self.inner.write().await;

        if inner.fail_remaining > 0 {
            inner.fail_remaining -= 1;
            return Err(BrokerError::Unavailable("injected failure".to_string()));
        }

        let message = Message {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        };

        inner
            .log
            .entry(topic.to_string())
            .or_default()
            .push(message.clone());

        if let Some(senders) = inner.subscribers.get_mut(topic) {
            // Drop subscribers whose receiver side is gone.
            senders.retain(|sender| sender.send(message.clone()).is_ok());
        }

        metrics::counter!("broker_messages_published").increment(1);
        Ok(())
    }
}
