//! Transaction verification service for a custodial deposit/withdrawal
//! platform.
//!
//! Reconciles pending deposit sessions and withdrawals against on-chain
//! reality via a chain indexer, then atomically settles the ledger:
//! transaction record, fiat balance, reservation release, source-record
//! status and a live update to the user's subscriber sessions.

pub mod api;
pub mod app;
pub mod config;
pub mod currency;
pub mod domain;
pub mod infra;
pub mod test_utils;
pub mod ws;
