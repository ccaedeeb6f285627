//! Chain-indexer clients.

pub mod helius;

pub use helius::{HeliusClient, HeliusConfig, decimals_for};
