//! Seeding, order, and inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{ProductId, UserId};
use ledger::{InMemoryStockLedger, InMemoryWalletLedger, StockLedger, WalletLedger};
use orders::{InMemoryOrderStore, InMemoryUserStore, Money, OrderStore, User, UserStore, total_amount};
use outbox::{InMemoryOutboxStore, OutboxStore};
use saga::{EventDispatcher, InMemoryBroker, NewOrderItem};
use serde::{Deserialize, Serialize};

use crate::AppSaga;
use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub saga: Arc<AppSaga>,
    pub dispatcher: EventDispatcher<InMemoryBroker, InMemoryOutboxStore>,
    pub orders: InMemoryOrderStore,
    pub users: InMemoryUserStore,
    pub stock: InMemoryStockLedger,
    pub wallets: InMemoryWalletLedger,
    pub outbox: InMemoryOutboxStore,
}

// -- Request types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default)]
    pub initial_points: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertProductRequest {
    pub product_id: String,
    pub stock: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedResponse {
    pub user_id: String,
    pub wallet_id: String,
    pub total_point: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductResponse {
    pub product_id: String,
    pub stock: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAcceptedResponse {
    pub order_id: String,
    pub status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemResponse {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEventResponse {
    pub aggregate_id: String,
    pub event_type: String,
    pub status: String,
    pub payload: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    pub wallet_id: String,
    pub user_id: String,
    pub total_point: i64,
    pub version: i64,
}

// -- Handlers --

/// POST /users — create a user together with their point wallet.
#[tracing::instrument(skip(state, req))]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserCreatedResponse>), ApiError> {
    let user = User::new(req.name);
    let user_id = user.id;
    state.users.insert(user).await?;
    let wallet = state.wallets.create(user_id, req.initial_points).await?;

    Ok((
        StatusCode::CREATED,
        Json(UserCreatedResponse {
            user_id: user_id.to_string(),
            wallet_id: wallet.id.to_string(),
            total_point: wallet.total_point,
        }),
    ))
}

/// POST /products — create or replace a product's stock row.
#[tracing::instrument(skip(state, req))]
pub async fn upsert_product(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpsertProductRequest>,
) -> Result<(StatusCode, Json<ProductResponse>), ApiError> {
    let product_id = ProductId::new(req.product_id.as_str());
    state.stock.upsert(product_id.clone(), req.stock).await?;

    Ok((
        StatusCode::CREATED,
        Json(ProductResponse {
            product_id: product_id.to_string(),
            stock: req.stock,
        }),
    ))
}

/// GET /products/:id — fetch a product's stock row.
#[tracing::instrument(skip(state))]
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ProductResponse>, ApiError> {
    let product_id = ProductId::new(id.as_str());
    let row = state
        .stock
        .get(&product_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Product {id} not found")))?;

    Ok(Json(ProductResponse {
        product_id: row.product_id.to_string(),
        stock: row.stock,
    }))
}

/// POST /orders — run the CreateOrder step and publish `order.created`.
///
/// Returns 202: the rest of the saga completes asynchronously through the
/// broker consumers, and the order settles into PAID or FAILED.
#[tracing::instrument(skip(state, req))]
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderAcceptedResponse>), ApiError> {
    let user_id = parse_user_id(&req.user_id)?;
    let items: Vec<NewOrderItem> = req
        .items
        .iter()
        .map(|item| NewOrderItem {
            product_id: ProductId::new(item.product_id.as_str()),
            quantity: item.quantity,
            unit_price: Money::from_cents(item.unit_price_cents),
        })
        .collect();

    let (order, event) = state.saga.create_order(user_id, items).await?;
    state.dispatcher.publish(&event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAcceptedResponse {
            order_id: order.id.to_string(),
            status: order.status.to_string(),
        }),
    ))
}

/// GET /orders/:id — load an order with its items.
#[tracing::instrument(skip(state))]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let (order, items) = state
        .orders
        .get(&order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(OrderResponse {
        id: order.id.to_string(),
        user_id: order.user_id.to_string(),
        status: order.status.to_string(),
        total_cents: total_amount(&items).cents(),
        items: items
            .into_iter()
            .map(|item| OrderItemResponse {
                product_id: item.product_id.to_string(),
                quantity: item.quantity,
                unit_price_cents: item.unit_price.cents(),
            })
            .collect(),
    }))
}

/// GET /orders/:id/events — list the order's outbox rows, oldest first.
#[tracing::instrument(skip(state))]
pub async fn order_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<OutboxEventResponse>>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let events = state
        .outbox
        .list_for_aggregate(&order_id.aggregate_id())
        .await?;

    Ok(Json(
        events
            .into_iter()
            .map(|event| OutboxEventResponse {
                aggregate_id: event.aggregate_id,
                event_type: event.event_type.to_string(),
                status: event.status.to_string(),
                payload: event.payload,
            })
            .collect(),
    ))
}

/// GET /wallets/:user_id — fetch a user's wallet snapshot.
#[tracing::instrument(skip(state))]
pub async fn get_wallet(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<WalletResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let wallet = state
        .wallets
        .get(&user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Wallet for user {user_id} not found")))?;

    Ok(Json(WalletResponse {
        wallet_id: wallet.id.to_string(),
        user_id: wallet.user_id.to_string(),
        total_point: wallet.total_point,
        version: wallet.version,
    }))
}

fn parse_user_id(id: &str) -> Result<UserId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid user ID: {e}")))?;
    Ok(UserId::from_uuid(uuid))
}

fn parse_order_id(id: &str) -> Result<common::OrderId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order ID: {e}")))?;
    Ok(common::OrderId::from_uuid(uuid))
}
