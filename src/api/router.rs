//! Route table.

use axum::Router;
use axum::routing::get;
use std::sync::Arc;

use super::handlers::{health_handler, pdm_webhook_handler, ws_handler};
use crate::app::AppState;

/// Builds the service router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/webhook/verify", get(pdm_webhook_handler))
        .with_state(state)
}
