//! Per-topic consumer loops.
//!
//! One explicit loop per topic advances the saga: `order.created` feeds the
//! DeductStock step and `order.deduct_stock` feeds CompletePayment. A loop
//! finishes its handler before taking the topic's next message, which —
//! together with the broker's per-key ordering — keeps one aggregate's
//! events in order. Handler errors are logged, never re-thrown; the
//! recovery poller owns stuck and failed rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledger::{StockLedger, WalletLedger};
use orders::{OrderStore, UserStore};
use outbox::{EventType, OutboxStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{InMemoryBroker, Message, MessageBroker};
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::events::{DeductStockPayload, OrderCreatedPayload};
use crate::steps::OrderSaga;

/// Consumer-side delivery locks.
///
/// Keyed by `(message key, topic)` — one logical event — with a short TTL.
/// When the broker redelivers an event that another consumer instance is
/// still processing, the second delivery is suppressed instead of running
/// the handler concurrently. The TTL bounds how long a crashed holder can
/// block redelivery.
#[derive(Clone)]
pub struct DeliveryLocks {
    held: Arc<Mutex<HashMap<(String, String), Instant>>>,
    ttl: Duration,
}

impl DeliveryLocks {
    /// Creates locks with the default ~4s TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(4))
    }

    /// Creates locks with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Attempts to take the lock for one logical event.
    pub async fn try_acquire(&self, key: &str, topic: &str) -> bool {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        held.retain(|_, acquired_at| now.duration_since(*acquired_at) < self.ttl);

        match held.entry((key.to_string(), topic.to_string())) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Releases the lock for one logical event.
    pub async fn release(&self, key: &str, topic: &str) {
        let mut held = self.held.lock().await;
        held.remove(&(key.to_string(), topic.to_string()));
    }
}

impl Default for DeliveryLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the saga's consumer loops against an in-memory broker.
///
/// Returns the task handles; dropping the broker's subscriptions (by
/// dropping the broker) ends the loops.
pub async fn spawn_consumers<O, U, S, W, X, B>(
    saga: Arc<OrderSaga<O, U, S, W, X>>,
    dispatcher: EventDispatcher<B, X>,
    broker: &InMemoryBroker,
    locks: DeliveryLocks,
) -> Vec<JoinHandle<()>>
where
    O: OrderStore + 'static,
    U: UserStore + 'static,
    S: StockLedger + 'static,
    W: WalletLedger + 'static,
    X: OutboxStore + Clone + 'static,
    B: MessageBroker + Clone + 'static,
{
    let mut handles = Vec::new();

    // order.created -> DeductStock
    {
        let saga = Arc::clone(&saga);
        let dispatcher = dispatcher.clone();
        let locks = locks.clone();
        let mut rx = broker.subscribe(EventType::OrderCreated.topic()).await;

        handles.push(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if !locks.try_acquire(&message.key, &message.topic).await {
                    tracing::debug!(key = %message.key, topic = %message.topic, "concurrent delivery suppressed");
                    continue;
                }

                let outcome = handle_order_created(&saga, &dispatcher, &message).await;
                if let Err(error) = outcome {
                    tracing::error!(%error, key = %message.key, "order.created handler failed");
                }

                locks.release(&message.key, &message.topic).await;
            }
        }));
    }

    // order.deduct_stock -> CompletePayment
    {
        let dispatcher = dispatcher.clone();
        let locks = locks.clone();
        let mut rx = broker.subscribe(EventType::DeductStock.topic()).await;

        handles.push(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if !locks.try_acquire(&message.key, &message.topic).await {
                    tracing::debug!(key = %message.key, topic = %message.topic, "concurrent delivery suppressed");
                    continue;
                }

                let outcome = handle_deduct_stock(&saga, &dispatcher, &message).await;
                if let Err(error) = outcome {
                    tracing::error!(%error, key = %message.key, "order.deduct_stock handler failed");
                }

                locks.release(&message.key, &message.topic).await;
            }
        }));
    }

    handles
}

async fn handle_order_created<O, U, S, W, X, B>(
    saga: &OrderSaga<O, U, S, W, X>,
    dispatcher: &EventDispatcher<B, X>,
    message: &Message,
) -> Result<()>
where
    O: OrderStore,
    U: UserStore,
    S: StockLedger,
    W: WalletLedger,
    X: OutboxStore,
    B: MessageBroker,
{
    let payload: OrderCreatedPayload = serde_json::from_value(message.payload.clone())?;
    if let Some(event) = saga.handle_order_created(payload).await? {
        dispatcher.publish(&event).await?;
    }
    Ok(())
}

async fn handle_deduct_stock<O, U, S, W, X, B>(
    saga: &OrderSaga<O, U, S, W, X>,
    dispatcher: &EventDispatcher<B, X>,
    message: &Message,
) -> Result<()>
where
    O: OrderStore,
    U: UserStore,
    S: StockLedger,
    W: WalletLedger,
    X: OutboxStore,
    B: MessageBroker,
{
    let payload: DeductStockPayload = serde_json::from_value(message.payload.clone())?;
    for event in saga.handle_deduct_stock(payload).await? {
        dispatcher.publish(&event).await?;
    }
    Ok(())
}
