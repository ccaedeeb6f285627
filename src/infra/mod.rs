//! Infrastructure layer implementations.

pub mod database;
pub mod exchange;
pub mod indexer;

pub use database::{PostgresConfig, PostgresStore};
pub use exchange::{CoinCapClient, ExchangeApiConfig};
pub use indexer::{HeliusClient, HeliusConfig};
