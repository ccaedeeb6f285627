//! Exchange-rate clients.

pub mod coincap;

pub use coincap::{CoinCapClient, ExchangeApiConfig};
