//! Integration tests for the service host.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::AppState;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower::ServiceExt;
use transport::InMemoryBroker;

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

async fn setup() -> (axum::Router, Arc<AppState>) {
    let config = Config {
        retry_base_delay: Duration::from_millis(10),
        ..Config::default()
    };
    let state = api::bootstrap(&config, Arc::new(InMemoryBroker::new()), get_metrics_handle())
        .await
        .unwrap();
    (api::create_app(state.clone()), state)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_order(app: &axum::Router, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

fn order(order_id: &str) -> Value {
    json!({
        "order_id": order_id,
        "customer_id": "c-1",
        "items": [
            {"product_id": "SKU-001", "quantity": 2, "unit_price_cents": 1000},
            {"product_id": "SKU-002", "quantity": 1, "unit_price_cents": 2500}
        ]
    })
}

/// Polls `/sagas` until no saga is active.
async fn wait_idle(app: &axum::Router) -> Value {
    for _ in 0..200 {
        let (_, stats) = get(app, "/sagas").await;
        if stats["active"] == 0 {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sagas still active");
}

#[tokio::test]
async fn test_health_check() {
    let (app, _state) = setup().await;

    let (status, json) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["broker"], "Connected");
    assert_eq!(json["open_circuits"], json!([]));
}

#[tokio::test]
async fn test_health_unavailable_when_disconnected() {
    let (app, state) = setup().await;
    state.connection.disconnect().await;

    let (status, json) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "unavailable");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _state) = setup().await;

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
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn test_breakers_listed() {
    let (app, _state) = setup().await;

    let (status, json) = get(&app, "/breakers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["name"], api::PAYMENT_GATEWAY);
    assert_eq!(json[0]["state"], "closed");
}

#[tokio::test]
async fn test_order_runs_fulfillment_saga() {
    let (app, state) = setup().await;

    let (status, json) = post_order(&app, order("o-1")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["saga_id"], "o-1");
    assert_eq!(json["total_cents"], 4500);

    let stats = wait_idle(&app).await;
    assert_eq!(stats["completed"], 1);
    assert_eq!(state.services.inventory.reservation_count(), 1);
    assert_eq!(state.services.payment.payment_count(), 1);
    assert_eq!(state.services.shipping.shipment_count(), 1);

    let (status, _) = get(&app, "/sagas/o-1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_declined_payment_compensates() {
    let (app, state) = setup().await;
    state.services.payment.set_fail_on_charge(true);

    let (status, _) = post_order(&app, order("o-2")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let stats = wait_idle(&app).await;
    assert_eq!(stats["failed"], 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.services.inventory.reservation_count(), 0);
    assert_eq!(state.services.payment.payment_count(), 0);
}

#[tokio::test]
async fn test_active_saga_status_and_duplicate_order() {
    let (app, state) = setup().await;
    state
        .services
        .payment
        .set_charge_latency(Some(Duration::from_secs(5)));

    let (status, _) = post_order(&app, order("o-3")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = get(&app, "/sagas/o-3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "Active");
    assert_eq!(
        json["steps"],
        json!(["reserve_inventory", "process_payment", "create_shipment"])
    );

    let (status, json) = post_order(&app, order("o-3")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("o-3"));
}

#[tokio::test]
async fn test_order_total_overflow_rejected() {
    let (app, state) = setup().await;

    let body = json!({
        "order_id": "o-4",
        "customer_id": "c-1",
        "items": [{"product_id": "SKU-001", "quantity": 2, "unit_price_cents": u64::MAX}]
    });
    let (status, json) = post_order(&app, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Order total is out of range");
    assert_eq!(state.orchestrator.active_count().await, 0);
}

#[tokio::test]
async fn test_order_without_items_rejected() {
    let (app, _state) = setup().await;

    let (status, json) = post_order(&app, json!({"customer_id": "c-1", "items": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Order has no items");
}
