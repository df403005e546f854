//! Typed payloads for the saga's event topics.
//!
//! Payloads serialize to camelCase JSON and travel as `serde_json::Value`
//! end to end — one canonical encoding, no re-stringification anywhere.

use std::collections::BTreeMap;

use common::{OrderId, ProductId, UserId, WalletId};
use ledger::Wallet;
use orders::{Order, OrderItem, total_amount};
use serde::{Deserialize, Serialize};

/// One order line as carried in the `order.created` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemSnapshot {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Payload of `order.created`: the order plus its item snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedPayload {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderItemSnapshot>,
    pub total_cents: i64,
}

impl OrderCreatedPayload {
    /// Builds the payload from an order and its items.
    pub fn from_order(order: &Order, items: &[OrderItem]) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            items: items
                .iter()
                .map(|item| OrderItemSnapshot {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price.cents(),
                })
                .collect(),
            total_cents: total_amount(items).cents(),
        }
    }

    /// Returns the productId -> quantity map in sorted product order.
    pub fn quantities(&self) -> BTreeMap<ProductId, u32> {
        self.items
            .iter()
            .map(|item| (item.product_id.clone(), item.quantity))
            .collect()
    }
}

/// Payload of `order.deduct_stock`: what was taken from which product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductStockPayload {
    pub order_id: OrderId,
    pub items: BTreeMap<ProductId, u32>,
}

/// Wallet state as carried in the `order.payment` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub wallet_id: WalletId,
    pub user_id: UserId,
    pub total_point: i64,
    pub version: i64,
}

impl From<&Wallet> for WalletSnapshot {
    fn from(wallet: &Wallet) -> Self {
        Self {
            wallet_id: wallet.id,
            user_id: wallet.user_id,
            total_point: wallet.total_point,
            version: wallet.version,
        }
    }
}

/// Payload of `order.payment`: the amount taken and the updated wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub order_id: OrderId,
    pub amount_cents: i64,
    pub wallet: WalletSnapshot,
}

/// Payload of `order.success`: the completed order summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummaryPayload {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub total_cents: i64,
    pub status: String,
}

/// Payload of `order.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFailedPayload {
    pub aggregate_id: String,
}
