use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::OrderId;
use tokio::sync::RwLock;

use crate::error::{OrderError, Result};
use crate::model::{Order, OrderItem, OrderStatus};

/// Trait for order store implementations.
///
/// Orders and their items are inserted together; items are immutable after
/// insertion and orders are never deleted.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts an order and its items as one atomic write.
    async fn insert(&self, order: Order, items: Vec<OrderItem>) -> Result<()>;

    /// Fetches an order with its items.
    async fn get(&self, order_id: &OrderId) -> Result<Option<(Order, Vec<OrderItem>)>>;

    /// Updates an order's status.
    async fn update_status(&self, order_id: &OrderId, status: OrderStatus) -> Result<()>;
}

/// In-memory order store.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, (Order, Vec<OrderItem>)>>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: Order, items: Vec<OrderItem>) -> Result<()> {
        if items.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id.to_string(),
                    quantity: item.quantity,
                });
            }
        }

        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(OrderError::AlreadyExists(order.id));
        }
        orders.insert(order.id, (order, items));
        Ok(())
    }

    async fn get(&self, order_id: &OrderId) -> Result<Option<(Order, Vec<OrderItem>)>> {
        let orders = self.orders.read().await;
        Ok(orders.get(order_id).cloned())
    }

    async fn update_status(&self, order_id: &OrderId, status: OrderStatus) -> Result<()> {
        let mut orders = self.orders.write().await;
        let (order, _) = orders
            .get_mut(order_id)
            .ok_or(OrderError::OrderNotFound(*order_id))?;
        order.status = status;
        order.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Money;
    use common::UserId;

    fn order_with_items() -> (Order, Vec<OrderItem>) {
        let order = Order::new(UserId::new());
        let items = vec![
            OrderItem::new(order.id, "SKU-001", 2, Money::from_cents(1000)),
            OrderItem::new(order.id, "SKU-002", 1, Money::from_cents(2500)),
        ];
        (order, items)
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryOrderStore::new();
        let (order, items) = order_with_items();
        let order_id = order.id;

        store.insert(order, items).await.unwrap();

        let (loaded, loaded_items) = store.get(&order_id).await.unwrap().unwrap();
        assert_eq!(loaded.id, order_id);
        assert_eq!(loaded.status, OrderStatus::PendingPayment);
        assert_eq!(loaded_items.len(), 2);
    }

    #[tokio::test]
    async fn insert_rejects_empty_order() {
        let store = InMemoryOrderStore::new();
        let order = Order::new(UserId::new());

        let result = store.insert(order, vec![]).await;
        assert!(matches!(result, Err(OrderError::EmptyOrder)));
    }

    #[tokio::test]
    async fn insert_rejects_zero_quantity() {
        let store = InMemoryOrderStore::new();
        let order = Order::new(UserId::new());
        let items = vec![OrderItem::new(order.id, "SKU-001", 0, Money::from_cents(1000))];

        let result = store.insert(order, items).await;
        assert!(matches!(result, Err(OrderError::InvalidQuantity { .. })));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = InMemoryOrderStore::new();
        let (order, items) = order_with_items();

        store.insert(order.clone(), items.clone()).await.unwrap();
        let result = store.insert(order, items).await;
        assert!(matches!(result, Err(OrderError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn update_status() {
        let store = InMemoryOrderStore::new();
        let (order, items) = order_with_items();
        let order_id = order.id;
        store.insert(order, items).await.unwrap();

        store.update_status(&order_id, OrderStatus::Paid).await.unwrap();

        let (loaded, _) = store.get(&order_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn update_status_unknown_order() {
        let store = InMemoryOrderStore::new();
        let result = store
            .update_status(&OrderId::new(), OrderStatus::Failed)
            .await;
        assert!(matches!(result, Err(OrderError::OrderNotFound(_))));
    }
}
