//! Integration tests for the API server.

use std::sync::OnceLock;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn setup() -> Router {
    let config = api::config::Config {
        poll_interval: Duration::from_millis(50),
        publish_retry_delay: Duration::from_millis(5),
        ..api::config::Config::default()
    };
    let state = api::bootstrap(&config).await;
    api::create_app(state, get_metrics_handle())
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Seeds a user with points and a product with stock; returns the user ID.
async fn seed(app: &Router, points: i64, stock: u32) -> String {
    let (status, user) = send(
        app,
        "POST",
        "/users",
        Some(serde_json::json!({"name": "buyer", "initialPoints": points})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        app,
        "POST",
        "/products",
        Some(serde_json::json!({"productId": "SKU-001", "stock": stock})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    user["userId"].as_str().unwrap().to_string()
}

/// Polls GET /orders/:id until the order reaches a terminal status.
async fn wait_for_terminal(app: &Router, order_id: &str) -> String {
    let poll = async {
        loop {
            let (status, order) = send(app, "GET", &format!("/orders/{order_id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            let order_status = order["status"].as_str().unwrap().to_string();
            if order_status != "PENDING_PAYMENT" {
                return order_status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("order did not settle")
}

#[tokio::test]
async fn test_health_check() {
    let app = setup().await;

    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_order_runs_to_paid() {
    let app = setup().await;
    let user_id = seed(&app, 10_000, 10).await;

    let (status, accepted) = send(
        &app,
        "POST",
        "/orders",
        Some(serde_json::json!({
            "userId": user_id,
            "items": [{"productId": "SKU-001", "quantity": 2, "unitPriceCents": 1500}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "PENDING_PAYMENT");

    let order_id = accepted["orderId"].as_str().unwrap();
    assert_eq!(wait_for_terminal(&app, order_id).await, "PAID");

    // The wallet paid the order total.
    let (status, wallet) = send(&app, "GET", &format!("/wallets/{user_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wallet["totalPoint"], 10_000 - 3000);

    // Stock left the shelf.
    let (_, product) = send(&app, "GET", "/products/SKU-001", None).await;
    assert_eq!(product["stock"], 8);

    // The saga's outbox trail is visible.
    let (status, events) = send(&app, "GET", &format!("/orders/{order_id}/events"), None).await;
    assert_eq!(status, StatusCode::OK);
    let topics: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["eventType"].as_str().unwrap())
        .collect();
    assert!(topics.contains(&"order.created"));
    assert!(topics.contains(&"order.deduct_stock"));
    assert!(topics.contains(&"order.payment"));
    assert!(topics.contains(&"order.success"));
}

#[tokio::test]
async fn test_insufficient_funds_order_fails_and_restocks() {
    let app = setup().await;
    let user_id = seed(&app, 100, 10).await;

    let (status, accepted) = send(
        &app,
        "POST",
        "/orders",
        Some(serde_json::json!({
            "userId": user_id,
            "items": [{"productId": "SKU-001", "quantity": 1, "unitPriceCents": 150}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let order_id = accepted["orderId"].as_str().unwrap();
    assert_eq!(wait_for_terminal(&app, order_id).await, "FAILED");

    // Wallet untouched.
    let (_, wallet) = send(&app, "GET", &format!("/wallets/{user_id}"), None).await;
    assert_eq!(wallet["totalPoint"], 100);

    // Compensation restocked the deducted unit.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, product) = send(&app, "GET", "/products/SKU-001", None).await;
        if product["stock"] == 10 || std::time::Instant::now() >= deadline {
            assert_eq!(product["stock"], 10);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_create_order_unknown_user() {
    let app = setup().await;

    let (status, _) = send(
        &app,
        "POST",
        "/orders",
        Some(serde_json::json!({
            "userId": uuid::Uuid::new_v4().to_string(),
            "items": [{"productId": "SKU-001", "quantity": 1, "unitPriceCents": 100}],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_order_invalid_user_id() {
    let app = setup().await;

    let (status, _) = send(
        &app,
        "POST",
        "/orders",
        Some(serde_json::json!({
            "userId": "not-a-uuid",
            "items": [{"productId": "SKU-001", "quantity": 1, "unitPriceCents": 100}],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_order_without_items() {
    let app = setup().await;
    let user_id = seed(&app, 1000, 10).await;

    let (status, _) = send(
        &app,
        "POST",
        "/orders",
        Some(serde_json::json!({"userId": user_id, "items": []})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_order_not_found() {
    let app = setup().await;

    let (status, _) = send(
        &app,
        "GET",
        &format!("/orders/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
