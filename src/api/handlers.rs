//! HTTP handlers: health, subscriber upgrade and the PDM webhook.
//!
//! The service is headless apart from this thin surface; request
//! routing, auth and the public API proper live in the platform
//! frontdoor.

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::domain::PdmWebhookRequest;
use crate::ws;

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = match state.store.health_check().await {
        Ok(()) => HealthStatus::Healthy,
        Err(_) => HealthStatus::Unhealthy,
    };

    let response = HealthResponse {
        status: database,
        database,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let code = match database {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(response)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: String,
}

/// Upgrades a subscriber connection and hands it to the hub pumps.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if query.user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    }

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| ws::run_connection(socket, query.user_id, hub))
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

/// Acknowledges and records a PDM verification event. Settlement for
/// PDM-fronted chains happens in the external processor.
pub async fn pdm_webhook_handler(Json(request): Json<PdmWebhookRequest>) -> Response {
    if request.event_type != "pdm.txverify" {
        warn!(event_type = %request.event_type, "Unknown PDM webhook event type");
        return (StatusCode::BAD_REQUEST, "unknown event type").into_response();
    }

    info!(
        event_type = %request.event_type,
        version = %request.version,
        payload_keys = request.payload.len(),
        "PDM webhook acknowledged"
    );

    Json(WebhookAck {
        status: "acknowledged",
    })
    .into_response()
}
