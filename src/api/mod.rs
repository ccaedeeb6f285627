//! The thin HTTP surface: health, subscriber upgrade, PDM webhook.

pub mod handlers;
pub mod router;

pub use handlers::{HealthResponse, HealthStatus};
pub use router::create_router;
