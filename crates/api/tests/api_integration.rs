//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox_store::{InMemoryStore, RetryPolicy, TransactionalStore};
use relay::{InMemoryBroker, RelayConfig};
use serde_json::{Value, json};
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

struct TestApp {
    app: axum::Router,
    state: Arc<api::routes::AppState>,
    broker: Arc<InMemoryBroker>,
}

fn setup() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let config = RelayConfig::default().with_retry(RetryPolicy::immediate(1));
    let state = api::create_state(store, broker.clone(), config);
    let app = api::create_app(state.clone(), get_metrics_handle());
    TestApp { app, state, broker }
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn widget_order() -> Value {
    json!({
        "items": [{
            "product_id": "SKU-001",
            "quantity": 2,
            "unit_price_cents": 1000
        }]
    })
}

async fn create_order(app: &axum::Router) -> String {
    let (status, json) = send(app, post_json("/orders", widget_order())).await;
    assert_eq!(status, StatusCode::CREATED);
    json["order_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Health & Metrics
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let t = setup();

    let (status, json) = send(&t.app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["relay_running"], false);
    assert_eq!(json["pending"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_relay_counters() {
    let t = setup();
    create_order(&t.app).await;
    t.state.relay.tick().await.unwrap();

    let response = t.app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("outbox_messages_published_total"));
}

// ============================================================================
// Orders
// ============================================================================

#[tokio::test]
async fn test_create_order_enqueues_event() {
    let t = setup();

    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .header("content-type", "application/json")
        .header("x-correlation-id", "req-42")
        .body(Body::from(serde_json::to_string(&widget_order()).unwrap()))
        .unwrap();
    let (status, json) = send(&t.app, request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["total_cents"], 2000);
    assert_eq!(json["correlation_id"], "req-42");

    let order_id = json["order_id"].as_str().unwrap();
    let (status, messages) = send(
        &t.app,
        get(&format!("/outbox/messages?aggregate_id={order_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["event_type"], "OrderCreated");
    assert_eq!(messages[0]["status"], "pending");
    assert_eq!(messages[0]["correlation_id"], "req-42");
}

#[tokio::test]
async fn test_create_and_get_order() {
    let t = setup();
    let order_id = create_order(&t.app).await;

    let (status, json) = send(&t.app, get(&format!("/orders/{order_id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], order_id);
    assert_eq!(json["total_cents"], 2000);
    assert_eq!(json["items"][0]["product_id"], "SKU-001");
}

#[tokio::test]
async fn test_invalid_order_is_rejected_without_event() {
    let t = setup();

    let (status, json) = send(&t.app, post_json("/orders", json!({ "items": [] }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("at least one item"));
    assert_eq!(t.state.store.status_counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_overflowing_order_total_is_bad_request() {
    let t = setup();
    let body = json!({
        "items": [{
            "product_id": "SKU-001",
            "quantity": 2,
            "unit_price_cents": i64::MAX
        }]
    });

    let (status, json) = send(&t.app, post_json("/orders", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("64 bits"));
    assert_eq!(t.state.store.status_counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_idempotency_key_deduplicates_orders() {
    let t = setup();
    let with_key = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json")
            .header("idempotency-key", key)
            .body(Body::from(serde_json::to_string(&widget_order()).unwrap()))
            .unwrap()
    };

    let (status, first) = send(&t.app, with_key("checkout-7")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, repeat) = send(&t.app, with_key("checkout-7")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(repeat["order_id"], first["order_id"]);
    assert_eq!(t.state.store.status_counts().await.unwrap().total(), 1);

    let (status, other) = send(&t.app, with_key("checkout-8")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(other["order_id"], first["order_id"]);
    assert_eq!(t.state.store.status_counts().await.unwrap().total(), 2);
}

#[tokio::test]
async fn test_get_nonexistent_order() {
    let t = setup();

    let (status, _) = send(&t.app, get(&format!("/orders/{}", uuid::Uuid::new_v4()))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_order_id_format() {
    let t = setup();

    let (status, _) = send(&t.app, get("/orders/not-a-uuid")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Outbox
// ============================================================================

#[tokio::test]
async fn test_relay_publishes_and_stats_reflect_it() {
    let t = setup();
    create_order(&t.app).await;
    create_order(&t.app).await;

    t.state.relay.tick().await.unwrap();

    assert_eq!(t.broker.publish_count(), 2);
    let (status, stats) = send(&t.app, get("/outbox/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messages_published"], 2);
    assert_eq!(stats["rows"]["published"], 2);
    assert_eq!(stats["rows"]["pending"], 0);
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let t = setup();
    create_order(&t.app).await;
    t.state.relay.tick().await.unwrap();
    create_order(&t.app).await;

    let (_, published) = send(&t.app, get("/outbox/messages?status=published")).await;
    let (_, pending) = send(&t.app, get("/outbox/messages?status=pending&limit=10")).await;
    let (status, _) = send(&t.app, get("/outbox/messages?status=bogus")).await;

    assert_eq!(published.as_array().unwrap().len(), 1);
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_outbox_message() {
    let t = setup();
    create_order(&t.app).await;
    let (_, messages) = send(&t.app, get("/outbox/messages")).await;
    let id = messages[0]["id"].as_str().unwrap().to_string();

    let (status, json) = send(&t.app, get(&format!("/outbox/messages/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id);

    let (status, _) = send(
        &t.app,
        get(&format!("/outbox/messages/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_replay_dead_letter() {
    let t = setup();
    create_order(&t.app).await;
    t.broker.set_fail_always(true);
    t.state.relay.tick().await.unwrap();

    let (_, dead) = send(&t.app, get("/outbox/messages?status=dead")).await;
    let dead_id = dead[0]["id"].as_str().unwrap().to_string();

    t.broker.set_fail_always(false);
    let (status, replayed) = send(
        &t.app,
        post_json(&format!("/outbox/messages/{dead_id}/replay"), Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replayed["causation_id"], dead_id);
    assert_eq!(replayed["status"], "pending");

    t.state.relay.tick().await.unwrap();
    assert_eq!(t.broker.publish_count(), 1);
}

#[tokio::test]
async fn test_replay_requires_dead_message() {
    let t = setup();
    create_order(&t.app).await;
    let (_, messages) = send(&t.app, get("/outbox/messages")).await;
    let id = messages[0]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &t.app,
        post_json(&format!("/outbox/messages/{id}/replay"), Value::Null),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
}
