//! Application state shared with the HTTP layer.

use std::sync::Arc;

use crate::domain::LedgerStore;
use crate::ws::HubHandle;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub hub: HubHandle,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, hub: HubHandle) -> Self {
        Self { store, hub }
    }
}
