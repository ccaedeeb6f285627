//! Application layer containing the verification loop, settlement engine
//! and shared state.

pub mod retry;
pub mod settlement;
pub mod state;
pub mod verification;

pub use settlement::{MatchedDeposit, SettlementEngine, find_matched_deposit};
pub use state::AppState;
pub use verification::{
    ChainRouter, ChainWorker, VerificationConfig, VerificationService, spawn_verification_loop,
};
