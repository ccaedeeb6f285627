//! Shared test doubles for unit and integration tests.

pub mod mocks;

pub use mocks::{
    DepositBehavior, MockChainVerifier, MockExchangeRateProvider, MockLedgerStore,
    RecordingBroadcaster, WithdrawalBehavior,
};
