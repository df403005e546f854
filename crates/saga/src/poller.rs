//! Recovery poller.
//!
//! A single background loop, independent of request and consumer tasks.
//! Each tick makes two passes over the outbox:
//!
//! - `Init` rows are re-dispatched with the bounded-retry dispatcher
//!   (exhaustion marks them `Fail`), at most five in flight at once.
//! - `Fail` rows are compensated by event type, after which the row is
//!   marked `Success` — compensation resolved the failure, it is not
//!   retried again.
//!
//! The outbox row status is the concurrency gate: a row that resolved
//! between passes is skipped by the monotonic status machine, so the
//! poller needs no mutex of its own.

use std::sync::Arc;
use std::time::Duration;

use common::OrderId;
use futures_util::StreamExt;
use futures_util::stream;
use ledger::StockLedger;
use orders::{OrderStatus, OrderStore};
use outbox::{EventType, OutboxEvent, OutboxStatus, OutboxStore};

use crate::broker::MessageBroker;
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::events::{DeductStockPayload, OrderFailedPayload};

/// Bounded fan-out for the INIT re-drive pass.
const MAX_CONCURRENT_DISPATCHES: usize = 5;

/// Background loop that re-drives stuck events and compensates failed ones.
pub struct RecoveryPoller<O, S, X, B>
where
    O: OrderStore,
    S: StockLedger,
    X: OutboxStore + Clone,
    B: MessageBroker,
{
    orders: O,
    stock: S,
    outbox: X,
    dispatcher: EventDispatcher<B, X>,
    interval: Duration,
}

impl<O, S, X, B> RecoveryPoller<O, S, X, B>
where
    O: OrderStore,
    S: StockLedger,
    X: OutboxStore + Clone,
    B: MessageBroker,
{
    /// Creates a poller with the default 5s tick interval.
    pub fn new(orders: O, stock: S, outbox: X, dispatcher: EventDispatcher<B, X>) -> Self {
        Self {
            orders,
            stock,
            outbox,
            dispatcher,
            interval: Duration::from_secs(5),
        }
    }

    /// Overrides the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the poller until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(error) = self.tick().await {
                tracing::error!(%error, "poller tick failed");
            }
        }
    }

    /// One full pass: re-drive `Init` rows, then compensate `Fail` rows.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<()> {
        self.redrive_pending().await?;
        self.compensate_failed().await
    }

    async fn redrive_pending(&self) -> Result<()> {
        let pending = self.outbox.list_by_status(OutboxStatus::Init).await?;
        if pending.is_empty() {
            return Ok(());
        }

        tracing::info!(count = pending.len(), "re-driving pending events");
        stream::iter(pending)
            .for_each_concurrent(MAX_CONCURRENT_DISPATCHES, |event| async move {
                if let Err(error) = self.dispatcher.publish(&event).await {
                    tracing::error!(%error, aggregate_id = %event.aggregate_id, "re-drive failed");
                }
            })
            .await;

        Ok(())
    }

    async fn compensate_failed(&self) -> Result<()> {
        let failed = self.outbox.list_by_status(OutboxStatus::Fail).await?;

        for event in failed {
            if let Err(error) = self.compensate(&event).await {
                tracing::error!(
                    %error,
                    aggregate_id = %event.aggregate_id,
                    event_type = %event.event_type,
                    "compensation failed; will retry next tick"
                );
            }
        }

        Ok(())
    }

    /// Compensates one failed event and resolves its row.
    ///
    /// Idempotent: an order that is already `Failed` was compensated
    /// before, so the stock re-add is skipped (no double-restock).
    async fn compensate(&self, event: &OutboxEvent) -> Result<()> {
        let aggregate_id = event.aggregate_id.as_str();

        let Some(order_id) = OrderId::from_aggregate_id(aggregate_id) else {
            tracing::error!(%aggregate_id, "unparseable aggregate id; leaving row failed");
            return Ok(());
        };
        let Some((order, _)) = self.orders.get(&order_id).await? else {
            tracing::warn!(%aggregate_id, "order missing; resolving row without compensation");
            self.outbox
                .update_status(aggregate_id, event.event_type, OutboxStatus::Success)
                .await?;
            return Ok(());
        };

        if order.status != OrderStatus::Failed {
            if event.event_type == EventType::Payment {
                self.restock_if_deducted(aggregate_id).await?;
            }
            self.orders
                .update_status(&order_id, OrderStatus::Failed)
                .await?;
            tracing::info!(%aggregate_id, failed_step = %event.event_type, "order failed after compensation");
        }

        // Make the terminal failure visible downstream.
        let failed_payload = OrderFailedPayload {
            aggregate_id: aggregate_id.to_string(),
        };
        let appended = self
            .outbox
            .append(
                aggregate_id,
                EventType::Failed,
                serde_json::to_value(&failed_payload)?,
            )
            .await?;
        if appended.is_recorded() {
            self.dispatcher.publish(appended.event()).await?;
        }

        // Compensation resolved the failure; the row is terminal now.
        self.outbox
            .update_status(aggregate_id, event.event_type, OutboxStatus::Success)
            .await?;
        metrics::counter!("poller_compensations").increment(1);

        Ok(())
    }

    /// Re-adds the deducted quantities if the deduction actually happened.
    ///
    /// The resolved `order.deduct_stock` row carries the productId ->
    /// quantity map; a `Fail` row for that step means nothing was deducted.
    async fn restock_if_deducted(&self, aggregate_id: &str) -> Result<()> {
        let Some(deduct_row) = self.outbox.find(aggregate_id, EventType::DeductStock).await?
        else {
            return Ok(());
        };
        if deduct_row.status == OutboxStatus::Fail {
            return Ok(());
        }

        let payload: DeductStockPayload = serde_json::from_value(deduct_row.payload)?;
        for (product_id, quantity) in &payload.items {
            self.stock.add(product_id, *quantity).await?;
        }

        metrics::counter!("poller_restocks").increment(1);
        tracing::info!(%aggregate_id, "restocked deducted items");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use common::{ProductId, UserId};
    use ledger::InMemoryStockLedger;
    use orders::{InMemoryOrderStore, Money, Order, OrderItem};
    use outbox::InMemoryOutboxStore;
    use std::collections::BTreeMap;

    struct Fixture {
        poller: RecoveryPoller<
            InMemoryOrderStore,
            InMemoryStockLedger,
            InMemoryOutboxStore,
            InMemoryBroker,
        >,
        orders: InMemoryOrderStore,
        stock: InMemoryStockLedger,
        outbox: InMemoryOutboxStore,
        broker: InMemoryBroker,
        order: Order,
    }

    async fn setup(stock_units: u32) -> Fixture {
        let orders = InMemoryOrderStore::new();
        let stock = InMemoryStockLedger::new();
        let outbox = InMemoryOutboxStore::new();
        let broker = InMemoryBroker::new();

        stock.upsert(ProductId::new("SKU-001"), stock_units).await.unwrap();

        let order = Order::new(UserId::new());
        let items = vec![OrderItem::new(order.id, "SKU-001", 2, Money::from_cents(1000))];
        orders.insert(order.clone(), items).await.unwrap();

        let dispatcher = EventDispatcher::new(broker.clone(), outbox.clone())
            .with_retry(3, Duration::from_millis(1));
        let poller = RecoveryPoller::new(
            orders.clone(),
            stock.clone(),
            outbox.clone(),
            dispatcher,
        );

        Fixture {
            poller,
            orders,
            stock,
            outbox,
            broker,
            order,
        }
    }

    #[tokio::test]
    async fn tick_redrives_pending_events() {
        let fx = setup(10).await;
        let aggregate_id = fx.order.aggregate_id();
        fx.outbox
            .append(&aggregate_id, EventType::OrderCreated, serde_json::json!({}))
            .await
            .unwrap();

        fx.poller.tick().await.unwrap();

        assert_eq!(fx.broker.published_count("order.created").await, 1);
        let row = fx
            .outbox
            .find(&aggregate_id, EventType::OrderCreated)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OutboxStatus::Success);
    }

    #[tokio::test]
    async fn exhausted_redrive_marks_fail_then_next_tick_compensates() {
        let fx = setup(10).await;
        let aggregate_id = fx.order.aggregate_id();
        fx.outbox
            .append(&aggregate_id, EventType::OrderCreated, serde_json::json!({}))
            .await
            .unwrap();

        fx.broker.fail_next_publishes(3).await;
        fx.poller.tick().await.unwrap();
        assert_eq!(
            fx.outbox
                .find(&aggregate_id, EventType::OrderCreated)
                .await
                .unwrap()
                .unwrap()
                .status,
            OutboxStatus::Fail
        );

        fx.poller.tick().await.unwrap();

        let (order, _) = fx.orders.get(&fx.order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(
            fx.outbox
                .find(&aggregate_id, EventType::OrderCreated)
                .await
                .unwrap()
                .unwrap()
                .status,
            OutboxStatus::Success
        );
        // Terminal failure was made visible downstream.
        assert_eq!(fx.broker.published_count("order.failed").await, 1);
    }

    #[tokio::test]
    async fn payment_failure_compensation_restocks_once() {
        let fx = setup(10).await;
        let aggregate_id = fx.order.aggregate_id();

        // The deduction happened and resolved; the payment failed.
        let deduct_payload = DeductStockPayload {
            order_id: fx.order.id,
            items: BTreeMap::from([(ProductId::new("SKU-001"), 2)]),
        };
        fx.stock.deduct(&deduct_payload.items).await.unwrap();
        fx.outbox
            .append(
                &aggregate_id,
                EventType::DeductStock,
                serde_json::to_value(&deduct_payload).unwrap(),
            )
            .await
            .unwrap();
        fx.outbox
            .update_status(&aggregate_id, EventType::DeductStock, OutboxStatus::Success)
            .await
            .unwrap();
        fx.outbox
            .append(&aggregate_id, EventType::Payment, serde_json::json!({}))
            .await
            .unwrap();
        fx.outbox
            .update_status(&aggregate_id, EventType::Payment, OutboxStatus::Fail)
            .await
            .unwrap();

        fx.poller.tick().await.unwrap();

        let product = ProductId::new("SKU-001");
        assert_eq!(fx.stock.get(&product).await.unwrap().unwrap().stock, 10);
        let (order, _) = fx.orders.get(&fx.order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);

        // Running compensation again must not restock a second time.
        let payment_row = fx
            .outbox
            .find(&aggregate_id, EventType::Payment)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment_row.status, OutboxStatus::Success);
        fx.poller.tick().await.unwrap();
        assert_eq!(fx.stock.get(&product).await.unwrap().unwrap().stock, 10);
    }

    #[tokio::test]
    async fn payment_failure_without_deduction_skips_restock() {
        let fx = setup(10).await;
        let aggregate_id = fx.order.aggregate_id();

        // Deduction itself failed; no stock left the shelf.
        fx.outbox
            .append(&aggregate_id, EventType::DeductStock, serde_json::json!({}))
            .await
            .unwrap();
        fx.outbox
            .update_status(&aggregate_id, EventType::DeductStock, OutboxStatus::Fail)
            .await
            .unwrap();

        fx.poller.tick().await.unwrap();

        assert_eq!(
            fx.stock
                .get(&ProductId::new("SKU-001"))
                .await
                .unwrap()
                .unwrap()
                .stock,
            10
        );
        let (order, _) = fx.orders.get(&fx.order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
    }
}
