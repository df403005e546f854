//! HTTP adapter and process wiring for the order saga system.
//!
//! The transport is deliberately thin: request validation, DTO mapping, and
//! status-code mapping live here; all saga and ledger semantics live in the
//! `saga` crate. The wiring runs fully in-process against the in-memory
//! stores and broker; the PostgreSQL store implementations slot in behind
//! the same traits for a durable deployment.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use ledger::{InMemoryStockLedger, InMemoryWalletLedger};
use metrics_exporter_prometheus::PrometheusHandle;
use orders::{InMemoryOrderStore, InMemoryUserStore};
use outbox::InMemoryOutboxStore;
use saga::{DeliveryLocks, EventDispatcher, InMemoryBroker, OrderSaga, RecoveryPoller, spawn_consumers};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
pub use routes::orders::AppState;

/// The saga handlers over the in-memory stores used by this process.
pub type AppSaga = OrderSaga<
    InMemoryOrderStore,
    InMemoryUserStore,
    InMemoryStockLedger,
    InMemoryWalletLedger,
    InMemoryOutboxStore,
>;

/// Builds the application state and spawns the saga's background tasks
/// (topic consumers and the recovery poller).
pub async fn bootstrap(config: &Config) -> Arc<AppState> {
    let order_store = InMemoryOrderStore::new();
    let users = InMemoryUserStore::new();
    let stock = InMemoryStockLedger::new();
    let wallets = InMemoryWalletLedger::new();
    let outbox = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::new();

    let saga = Arc::new(OrderSaga::new(
        order_store.clone(),
        users.clone(),
        stock.clone(),
        wallets.clone(),
        outbox.clone(),
    ));
    let dispatcher = EventDispatcher::new(broker.clone(), outbox.clone())
        .with_retry(config.publish_max_attempts, config.publish_retry_delay);

    spawn_consumers(
        Arc::clone(&saga),
        dispatcher.clone(),
        &broker,
        DeliveryLocks::with_ttl(config.delivery_lock_ttl),
    )
    .await;

    let poller = Arc::new(
        RecoveryPoller::new(
            order_store.clone(),
            stock.clone(),
            outbox.clone(),
            dispatcher.clone(),
        )
        .with_interval(config.poll_interval),
    );
    tokio::spawn(poller.run());

    Arc::new(AppState {
        saga,
        dispatcher,
        orders: order_store,
        users,
        stock,
        wallets,
        outbox,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/users", post(routes::orders::create_user))
        .route("/products", post(routes::orders::upsert_product))
        .route("/products/{id}", get(routes::orders::get_product))
        .route("/orders", post(routes::orders::create_order))
        .route("/orders/{id}", get(routes::orders::get_order))
        .route("/orders/{id}/events", get(routes::orders::order_events))
        .route("/wallets/{user_id}", get(routes::orders::get_wallet))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
