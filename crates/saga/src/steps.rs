//! The three saga step handlers.
//!
//! Each step performs one resource mutation plus one outbox record. The
//! mutation happens first; if the append then fails, the mutation is undone
//! before the error surfaces, so no mutation survives without its event and
//! no event exists for a mutation that did not happen.
//!
//! Domain failures in the asynchronous steps (DeductStock, CompletePayment)
//! never propagate to a caller: the step's outbox row is recorded as `Fail`
//! and resolution becomes the recovery poller's responsibility. Only
//! CreateOrder, which runs on the request path, surfaces domain errors
//! synchronously.

use common::UserId;
use ledger::{LedgerError, StockLedger, WalletLedger};
use orders::{Money, Order, OrderItem, OrderStatus, OrderStore, UserStore, total_amount};
use outbox::{EventType, OutboxEvent, OutboxStatus, OutboxStore};

use crate::error::Result;
use crate::events::{
    DeductStockPayload, OrderCreatedPayload, OrderFailedPayload, OrderSummaryPayload,
    PaymentPayload,
};

/// One requested order line, as it arrives from the client.
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: common::ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

/// The saga step handlers over their five stores.
pub struct OrderSaga<O, U, S, W, X>
where
    O: OrderStore,
    U: UserStore,
    S: StockLedger,
    W: WalletLedger,
    X: OutboxStore,
{
    orders: O,
    users: U,
    stock: S,
    wallets: W,
    outbox: X,
}

impl<O, U, S, W, X> OrderSaga<O, U, S, W, X>
where
    O: OrderStore,
    U: UserStore,
    S: StockLedger,
    W: WalletLedger,
    X: OutboxStore,
{
    /// Creates the saga handlers over the given stores.
    pub fn new(orders: O, users: U, stock: S, wallets: W, outbox: X) -> Self {
        Self {
            orders,
            users,
            stock,
            wallets,
            outbox,
        }
    }

    /// Step 1 — CreateOrder.
    ///
    /// Validates the user, inserts the order and its price-snapshotted
    /// items, and records `order.created`. Domain errors surface to the
    /// caller; this is the only step that runs on the request path.
    ///
    /// Returns the order together with the outbox event to publish.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn create_order(
        &self,
        user_id: UserId,
        items: Vec<NewOrderItem>,
    ) -> Result<(Order, OutboxEvent)> {
        metrics::counter!("saga_orders_requested").increment(1);

        if !self.users.exists(&user_id).await? {
            return Err(orders::OrderError::UserNotFound(user_id).into());
        }
        if items.is_empty() {
            return Err(orders::OrderError::EmptyOrder.into());
        }

        let order = Order::new(user_id);
        let order_items: Vec<OrderItem> = items
            .into_iter()
            .map(|item| OrderItem::new(order.id, item.product_id, item.quantity, item.unit_price))
            .collect();

        self.orders.insert(order.clone(), order_items.clone()).await?;

        let payload = OrderCreatedPayload::from_order(&order, &order_items);
        let aggregate_id = order.aggregate_id();
        let appended = match self
            .outbox
            .append(
                &aggregate_id,
                EventType::OrderCreated,
                serde_json::to_value(&payload)?,
            )
            .await
        {
            Ok(appended) => appended,
            Err(error) => {
                // The order must not stand without its event record.
                self.orders
                    .update_status(&order.id, OrderStatus::Failed)
                    .await?;
                return Err(error.into());
            }
        };

        tracing::info!(%aggregate_id, total = payload.total_cents, "order created");
        Ok((order, appended.event().clone()))
    }

    /// Step 2 — DeductStock, triggered by consuming `order.created`.
    ///
    /// Returns the `order.deduct_stock` event to publish, or `None` when
    /// the step was an idempotent replay or its failure was recorded.
    #[tracing::instrument(skip(self, payload), fields(order_id = %payload.order_id))]
    pub async fn handle_order_created(
        &self,
        payload: OrderCreatedPayload,
    ) -> Result<Option<OutboxEvent>> {
        let aggregate_id = payload.order_id.aggregate_id();

        if let Some(existing) = self
            .outbox
            .find(&aggregate_id, EventType::DeductStock)
            .await?
        {
            if existing.status == OutboxStatus::Init {
                // The deduction already happened; only the publish is owed.
                return Ok(Some(existing));
            }
            tracing::debug!(%aggregate_id, "deduct_stock already resolved, skipping replay");
            return Ok(None);
        }

        let quantities = payload.quantities();
        match self.stock.deduct(&quantities).await {
            Ok(()) => {
                let step_payload = DeductStockPayload {
                    order_id: payload.order_id,
                    items: quantities.clone(),
                };
                let appended = match self
                    .outbox
                    .append(
                        &aggregate_id,
                        EventType::DeductStock,
                        serde_json::to_value(&step_payload)?,
                    )
                    .await
                {
                    Ok(appended) => appended,
                    Err(error) => {
                        // Undo the deduction before surfacing the error.
                        for (product_id, quantity) in &quantities {
                            self.stock.add(product_id, *quantity).await?;
                        }
                        return Err(error.into());
                    }
                };
                Ok(Some(appended.event().clone()))
            }
            Err(error @ (LedgerError::OutOfStock { .. } | LedgerError::ProductNotFound(_))) => {
                let failure_payload = serde_json::json!({
                    "orderId": payload.order_id,
                    "error": error.to_string(),
                });
                self.record_step_failure(
                    &aggregate_id,
                    EventType::DeductStock,
                    failure_payload,
                    &error.to_string(),
                )
                .await?;
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Step 3 — CompletePayment, triggered by consuming
    /// `order.deduct_stock`.
    ///
    /// Returns the events to publish: `order.payment` + `order.success` on
    /// the happy path, `order.failed` on the failure path, nothing on an
    /// idempotent replay.
    #[tracing::instrument(skip(self, payload), fields(order_id = %payload.order_id))]
    pub async fn handle_deduct_stock(
        &self,
        payload: DeductStockPayload,
    ) -> Result<Vec<OutboxEvent>> {
        let aggregate_id = payload.order_id.aggregate_id();

        if let Some(existing) = self.outbox.find(&aggregate_id, EventType::Payment).await? {
            if existing.status == OutboxStatus::Init {
                // Payment applied but not yet published; re-drive the
                // publishes only.
                let mut events = vec![existing];
                if let Some(success) = self.outbox.find(&aggregate_id, EventType::Success).await?
                    && success.status == OutboxStatus::Init
                {
                    events.push(success);
                }
                return Ok(events);
            }
            tracing::debug!(%aggregate_id, "payment already resolved, skipping replay");
            return Ok(Vec::new());
        }

        let Some((order, items)) = self.orders.get(&payload.order_id).await? else {
            let failure_payload = serde_json::json!({
                "orderId": payload.order_id,
                "error": "order not found",
            });
            self.record_step_failure(
                &aggregate_id,
                EventType::Payment,
                failure_payload,
                "order not found",
            )
            .await?;
            return Ok(self.append_order_failed(&aggregate_id).await?.into_iter().collect());
        };

        let total = total_amount(&items);
        match self.wallets.debit(&order.user_id, total.cents()).await {
            Ok(wallet) => {
                let payment_payload = PaymentPayload {
                    order_id: order.id,
                    amount_cents: total.cents(),
                    wallet: (&wallet).into(),
                };
                let payment_event = match self
                    .outbox
                    .append(
                        &aggregate_id,
                        EventType::Payment,
                        serde_json::to_value(&payment_payload)?,
                    )
                    .await
                {
                    Ok(appended) => appended.event().clone(),
                    Err(error) => {
                        // Undo the debit before surfacing the error.
                        self.wallets.charge(&order.user_id, total.cents()).await?;
                        return Err(error.into());
                    }
                };

                self.orders
                    .update_status(&order.id, OrderStatus::Paid)
                    .await?;

                let summary = OrderSummaryPayload {
                    order_id: order.id,
                    user_id: order.user_id,
                    total_cents: total.cents(),
                    status: OrderStatus::Paid.as_str().to_string(),
                };
                let success_event = self
                    .outbox
                    .append(
                        &aggregate_id,
                        EventType::Success,
                        serde_json::to_value(&summary)?,
                    )
                    .await?
                    .event()
                    .clone();

                metrics::counter!("saga_completed").increment(1);
                tracing::info!(%aggregate_id, amount = total.cents(), "payment completed");
                Ok(vec![payment_event, success_event])
            }
            Err(
                error @ (LedgerError::InsufficientBalance { .. }
                | LedgerError::VersionConflict { .. }
                | LedgerError::WalletNotFound(_)),
            ) => {
                let failure_payload = serde_json::json!({
                    "orderId": payload.order_id,
                    "amountCents": total.cents(),
                    "error": error.to_string(),
                });
                self.record_step_failure(
                    &aggregate_id,
                    EventType::Payment,
                    failure_payload,
                    &error.to_string(),
                )
                .await?;
                Ok(self.append_order_failed(&aggregate_id).await?.into_iter().collect())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Records a step's outbox row as `Fail` for the poller to compensate.
    async fn record_step_failure(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
        reason: &str,
    ) -> Result<()> {
        tracing::warn!(%aggregate_id, %event_type, reason, "saga step failed; recorded for compensation");
        metrics::counter!("saga_step_failures").increment(1);

        self.outbox.append(aggregate_id, event_type, payload).await?;
        self.outbox
            .update_status(aggregate_id, event_type, OutboxStatus::Fail)
            .await?;
        Ok(())
    }

    /// Appends `order.failed` for the aggregate if not already present.
    async fn append_order_failed(&self, aggregate_id: &str) -> Result<Option<OutboxEvent>> {
        let payload = OrderFailedPayload {
            aggregate_id: aggregate_id.to_string(),
        };
        let appended = self
            .outbox
            .append(
                aggregate_id,
                EventType::Failed,
                serde_json::to_value(&payload)?,
            )
            .await?;
        Ok(appended.is_recorded().then(|| appended.event().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SagaError;
    use common::ProductId;
    use ledger::{InMemoryStockLedger, InMemoryWalletLedger};
    use orders::{InMemoryOrderStore, InMemoryUserStore, User};
    use outbox::InMemoryOutboxStore;

    type TestSaga = OrderSaga<
        InMemoryOrderStore,
        InMemoryUserStore,
        InMemoryStockLedger,
        InMemoryWalletLedger,
        InMemoryOutboxStore,
    >;

    struct Fixture {
        saga: TestSaga,
        orders: InMemoryOrderStore,
        stock: InMemoryStockLedger,
        wallets: InMemoryWalletLedger,
        outbox: InMemoryOutboxStore,
        user_id: UserId,
    }

    async fn setup(stock_units: u32, wallet_points: i64) -> Fixture {
        let orders = InMemoryOrderStore::new();
        let users = InMemoryUserStore::new();
        let stock = InMemoryStockLedger::new();
        let wallets = InMemoryWalletLedger::new();
        let outbox = InMemoryOutboxStore::new();

        let user = User::new("buyer");
        let user_id = user.id;
        users.insert(user).await.unwrap();
        stock.upsert(ProductId::new("SKU-001"), stock_units).await.unwrap();
        wallets.create(user_id, wallet_points).await.unwrap();

        let saga = OrderSaga::new(
            orders.clone(),
            users,
            stock.clone(),
            wallets.clone(),
            outbox.clone(),
        );

        Fixture {
            saga,
            orders,
            stock,
            wallets,
            outbox,
            user_id,
        }
    }

    fn one_item(quantity: u32, price_cents: i64) -> Vec<NewOrderItem> {
        vec![NewOrderItem {
            product_id: ProductId::new("SKU-001"),
            quantity,
            unit_price: Money::from_cents(price_cents),
        }]
    }

    #[tokio::test]
    async fn create_order_records_outbox_event() {
        let fx = setup(10, 10_000).await;

        let (order, event) = fx
            .saga
            .create_order(fx.user_id, one_item(2, 1000))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(event.event_type, EventType::OrderCreated);
        assert_eq!(event.status, OutboxStatus::Init);
        assert_eq!(event.aggregate_id, order.aggregate_id());

        let payload: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();
        assert_eq!(payload.total_cents, 2000);
    }

    #[tokio::test]
    async fn create_order_unknown_user_fails_synchronously() {
        let fx = setup(10, 10_000).await;

        let result = fx.saga.create_order(UserId::new(), one_item(1, 1000)).await;
        assert!(matches!(
            result,
            Err(SagaError::Order(orders::OrderError::UserNotFound(_)))
        ));
        assert_eq!(fx.outbox.event_count().await, 0);
    }

    #[tokio::test]
    async fn create_order_rejects_empty_items() {
        let fx = setup(10, 10_000).await;

        let result = fx.saga.create_order(fx.user_id, vec![]).await;
        assert!(matches!(
            result,
            Err(SagaError::Order(orders::OrderError::EmptyOrder))
        ));
    }

    #[tokio::test]
    async fn deduct_stock_happy_path() {
        let fx = setup(10, 10_000).await;
        let (order, event) = fx
            .saga
            .create_order(fx.user_id, one_item(3, 1000))
            .await
            .unwrap();
        let payload: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();

        let next = fx.saga.handle_order_created(payload).await.unwrap().unwrap();

        assert_eq!(next.event_type, EventType::DeductStock);
        assert_eq!(next.status, OutboxStatus::Init);
        assert_eq!(
            fx.stock.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock,
            7
        );

        let step_payload: DeductStockPayload = serde_json::from_value(next.payload).unwrap();
        assert_eq!(step_payload.order_id, order.id);
    }

    #[tokio::test]
    async fn deduct_stock_replay_is_idempotent() {
        let fx = setup(10, 10_000).await;
        let (_, event) = fx
            .saga
            .create_order(fx.user_id, one_item(3, 1000))
            .await
            .unwrap();
        let payload: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();

        let first = fx.saga.handle_order_created(payload.clone()).await.unwrap();
        assert!(first.is_some());

        // Replay with the step row still Init: stock untouched, same event back.
        let replay = fx.saga.handle_order_created(payload.clone()).await.unwrap();
        assert!(replay.is_some());
        assert_eq!(
            fx.stock.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock,
            7
        );

        // Replay after resolution: short-circuit.
        let aggregate_id = first.unwrap().aggregate_id;
        fx.outbox
            .update_status(&aggregate_id, EventType::DeductStock, OutboxStatus::Success)
            .await
            .unwrap();
        let resolved = fx.saga.handle_order_created(payload).await.unwrap();
        assert!(resolved.is_none());
        assert_eq!(
            fx.stock.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock,
            7
        );
    }

    #[tokio::test]
    async fn deduct_stock_out_of_stock_records_fail_row() {
        let fx = setup(2, 10_000).await;
        let (order, event) = fx
            .saga
            .create_order(fx.user_id, one_item(5, 1000))
            .await
            .unwrap();
        let payload: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();

        let next = fx.saga.handle_order_created(payload).await.unwrap();
        assert!(next.is_none());

        let row = fx
            .outbox
            .find(&order.aggregate_id(), EventType::DeductStock)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OutboxStatus::Fail);
        // Stock untouched.
        assert_eq!(
            fx.stock.get(&ProductId::new("SKU-001")).await.unwrap().unwrap().stock,
            2
        );
    }

    #[tokio::test]
    async fn complete_payment_happy_path() {
        let fx = setup(10, 10_000).await;
        let (order, event) = fx
            .saga
            .create_order(fx.user_id, one_item(2, 1500))
            .await
            .unwrap();
        let created: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();
        let deduct = fx.saga.handle_order_created(created).await.unwrap().unwrap();
        let deduct_payload: DeductStockPayload = serde_json::from_value(deduct.payload).unwrap();

        let events = fx.saga.handle_deduct_stock(deduct_payload).await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Payment);
        assert_eq!(events[1].event_type, EventType::Success);

        // Order is paid, wallet debited by the order total.
        let (loaded, _) = fx.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Paid);
        let wallet = fx.wallets.get(&fx.user_id).await.unwrap().unwrap();
        assert_eq!(wallet.total_point, 10_000 - 3000);
        assert_eq!(wallet.version, 1);

        let payment: PaymentPayload = serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payment.amount_cents, 3000);
        assert_eq!(payment.wallet.total_point, 7000);
    }

    #[tokio::test]
    async fn complete_payment_insufficient_balance_records_fail_and_order_failed() {
        let fx = setup(10, 100).await;
        let (order, event) = fx
            .saga
            .create_order(fx.user_id, one_item(1, 150))
            .await
            .unwrap();
        let created: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();
        let deduct = fx.saga.handle_order_created(created).await.unwrap().unwrap();
        let deduct_payload: DeductStockPayload = serde_json::from_value(deduct.payload).unwrap();

        let events = fx.saga.handle_deduct_stock(deduct_payload).await.unwrap();

        // Only order.failed comes back for publication.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Failed);

        let payment_row = fx
            .outbox
            .find(&order.aggregate_id(), EventType::Payment)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment_row.status, OutboxStatus::Fail);

        // Wallet untouched: balance, version, and audit trail.
        let wallet = fx.wallets.get(&fx.user_id).await.unwrap().unwrap();
        assert_eq!(wallet.total_point, 100);
        assert_eq!(wallet.version, 0);
        assert_eq!(fx.wallets.points(&wallet.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_payment_replay_is_idempotent() {
        let fx = setup(10, 10_000).await;
        let (_, event) = fx
            .saga
            .create_order(fx.user_id, one_item(1, 1000))
            .await
            .unwrap();
        let created: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();
        let deduct = fx.saga.handle_order_created(created).await.unwrap().unwrap();
        let deduct_payload: DeductStockPayload = serde_json::from_value(deduct.payload).unwrap();

        let first = fx.saga.handle_deduct_stock(deduct_payload.clone()).await.unwrap();
        assert_eq!(first.len(), 2);

        // Rows still Init: replay re-offers the publishes, no second debit.
        let replay = fx.saga.handle_deduct_stock(deduct_payload.clone()).await.unwrap();
        assert_eq!(replay.len(), 2);

        let aggregate_id = first[0].aggregate_id.clone();
        fx.outbox
            .update_status(&aggregate_id, EventType::Payment, OutboxStatus::Success)
            .await
            .unwrap();
        let resolved = fx.saga.handle_deduct_stock(deduct_payload).await.unwrap();
        assert!(resolved.is_empty());

        let wallet = fx.wallets.get(&fx.user_id).await.unwrap().unwrap();
        assert_eq!(wallet.version, 1);
        assert_eq!(wallet.total_point, 9000);
    }

    #[tokio::test]
    async fn order_total_matches_debited_amount() {
        let fx = setup(10, 10_000).await;
        let items = vec![
            NewOrderItem {
                product_id: ProductId::new("SKU-001"),
                quantity: 3,
                unit_price: Money::from_cents(700),
            },
        ];
        let (order, event) = fx.saga.create_order(fx.user_id, items).await.unwrap();
        let created: OrderCreatedPayload = serde_json::from_value(event.payload).unwrap();
        let deduct = fx.saga.handle_order_created(created).await.unwrap().unwrap();
        let deduct_payload: DeductStockPayload = serde_json::from_value(deduct.payload).unwrap();
        fx.saga.handle_deduct_stock(deduct_payload).await.unwrap();

        let (_, stored_items) = fx.orders.get(&order.id).await.unwrap().unwrap();
        let total = total_amount(&stored_items);
        let wallet = fx.wallets.get(&fx.user_id).await.unwrap().unwrap();
        assert_eq!(wallet.total_point, 10_000 - total.cents());
    }
}
