//! Router-level tests for the thin HTTP surface.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use transaction_verifier::api::{HealthResponse, HealthStatus, create_router};
use transaction_verifier::app::AppState;
use transaction_verifier::test_utils::MockLedgerStore;
use transaction_verifier::ws::WsHub;

fn test_state() -> Arc<AppState> {
    let (_hub_task, hub) = WsHub::spawn();
    Arc::new(AppState::new(Arc::new(MockLedgerStore::new()), hub))
}

#[tokio::test]
async fn test_health_returns_healthy() {
    let router = create_router(test_state());

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let health: HealthResponse = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.database, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_pdm_webhook_acknowledges_verify_events() {
    let router = create_router(test_state());

    let payload = serde_json::json!({
        "event_type": "pdm.txverify",
        "payload": { "tx_hash": "abc123", "chain_id": "btc-mainnet" },
        "version": "1",
        "secret": "shh"
    });

    let request = Request::builder()
        .method("GET")
        .uri("/webhook/verify")
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let ack: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(ack["status"], "acknowledged");
}

#[tokio::test]
async fn test_pdm_webhook_rejects_unknown_event_type() {
    let router = create_router(test_state());

    let payload = serde_json::json!({
        "event_type": "pdm.unknown",
        "payload": {},
        "version": "1",
        "secret": "shh"
    });

    let request = Request::builder()
        .method("GET")
        .uri("/webhook/verify")
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ws_upgrade_requires_user_id() {
    let router = create_router(test_state());

    let request = Request::builder()
        .method("GET")
        .uri("/ws")
        .body(Body::empty())
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    // missing query string fails extraction before the upgrade
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
