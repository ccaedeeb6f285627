//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{
    AppError, ConfigError, DatabaseError, ExchangeRateError, IndexerError, ValidationError,
};
pub use traits::{
    ChainVerifier, DepositCheck, DepositProbe, DepositSettlement, ExchangeRateProvider,
    FailedWithdrawalOutcome, LedgerStore, SettlementOutcome, UpdateBroadcaster, WithdrawalCheck,
    WithdrawalProbe, WithdrawalSettlement,
};
pub use types::{
    Balance, BalanceLog, DepositSession, ExchangeRate, IndexedTransaction, NativeTransfer,
    PdmWebhookRequest, ProcessorKind, SessionStatus, SolanaCluster, SplToken, TokenTransfer,
    Transaction, TransactionKind, VerificationStatus, Withdrawal, WithdrawalStatus, is_pdm_chain,
};
