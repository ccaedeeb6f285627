//! Domain traits defining contracts for persistence, chain verification,
//! exchange rates and subscriber broadcasts.

use async_trait::async_trait;
use std::collections::HashMap;

use super::error::AppError;
use super::types::{
    Balance, DepositSession, ExchangeRate, IndexedTransaction, SolanaCluster, SplToken,
    Transaction, Withdrawal,
};

/// Expected counterparty of a deposit, in base units.
#[derive(Debug, Clone)]
pub struct DepositProbe {
    /// The session wallet address (expected recipient)
    pub address: String,
    /// Required amount in base units: lamports for SOL, 10^decimals
    /// otherwise
    pub required_amount: i64,
    pub token: SplToken,
    pub cluster: SolanaCluster,
}

/// A known outbound transaction to validate.
#[derive(Debug, Clone)]
pub struct WithdrawalProbe {
    pub tx_hash: String,
    pub to_address: String,
    /// Decimal units (SOL for native, token units for SPL)
    pub amount: f64,
    pub token: SplToken,
    pub cluster: SolanaCluster,
}

/// Outcome of a deposit scan. A no-match is a value, not an error: the
/// transfer may simply not be indexed yet.
#[derive(Debug, Clone)]
pub struct DepositCheck {
    pub matched: bool,
    pub transactions: Vec<IndexedTransaction>,
}

/// Outcome of a withdrawal lookup by hash.
#[derive(Debug, Clone)]
pub struct WithdrawalCheck {
    pub matched: bool,
    pub transaction: Option<IndexedTransaction>,
}

/// Chain verifier contract: locate or validate a transfer against an
/// expected counterparty.
#[async_trait]
pub trait ChainVerifier: Send + Sync {
    /// Scans recent transfers to `probe.address` for one of at least the
    /// required amount in the right token.
    async fn verify_deposit(&self, probe: &DepositProbe) -> Result<DepositCheck, AppError>;

    /// Fetches `probe.tx_hash` and validates recipient, token and amount.
    async fn verify_withdrawal(&self, probe: &WithdrawalProbe)
    -> Result<WithdrawalCheck, AppError>;

    /// Base-unit decimals for a (cluster, token) pair.
    fn decimals(&self, cluster: SolanaCluster, token: SplToken) -> Result<u32, AppError>;

    /// Mint address for an SPL token on a cluster. A missing entry is a
    /// permanent configuration error.
    fn mint_address(&self, cluster: SolanaCluster, token: SplToken) -> Result<String, AppError>;
}

/// All writes needed to settle a verified deposit, committed atomically.
#[derive(Debug, Clone)]
pub struct DepositSettlement {
    pub session: DepositSession,
    pub transaction: Transaction,
    pub usd_amount_cents: i64,
    /// Added to the balance's display units: tx_amount * exchange_rate
    pub units_delta: f64,
}

/// All writes needed to settle a verified withdrawal, committed atomically.
#[derive(Debug, Clone)]
pub struct WithdrawalSettlement {
    pub withdrawal: Withdrawal,
    pub transaction: Transaction,
    pub usd_amount_cents: i64,
    pub units_delta: f64,
}

/// Result of an atomic settlement commit.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// Committed; carries the post-settlement balance for broadcasting.
    Applied { balance: Balance },
    /// Another pickup of the same record already settled it. Treated as
    /// success by callers.
    AlreadySettled,
}

/// Result of marking a withdrawal failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailedWithdrawalOutcome {
    /// Carries the updated withdrawal and how many reserved cents were
    /// returned to the available pool (0 if already released).
    Applied {
        withdrawal: Withdrawal,
        released_cents: i64,
    },
    AlreadySettled,
}

/// The single persistence contract for the verification core.
///
/// The settlement methods each run in one database transaction: they
/// re-check the source record's status, rely on the unique
/// `(chain_id, tx_hash, transaction_type)` index to absorb duplicate
/// inserts, and apply balance arithmetic against rows read under the
/// same transaction. A second pickup of an already-settled record
/// resolves to `AlreadySettled`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Pending deposit sessions, ascending by created_at.
    async fn load_pending_deposit_sessions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DepositSession>, AppError>;

    /// Pending withdrawals, ascending by created_at.
    async fn load_pending_withdrawals(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Withdrawal>, AppError>;

    /// Marks a session expired with the given message. A no-op if the
    /// session already reached a terminal status. Returns the updated
    /// session when the transition applied.
    async fn expire_deposit_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Option<DepositSession>, AppError>;

    async fn get_balance(&self, user_id: &str, currency_code: &str) -> Result<Balance, AppError>;

    /// Insert transaction, credit balance, complete session, append a
    /// balance log. Atomic.
    async fn settle_deposit(
        &self,
        settlement: &DepositSettlement,
    ) -> Result<SettlementOutcome, AppError>;

    /// Insert transaction, debit balance, release the reservation if
    /// still held, complete withdrawal, append a balance log. Atomic.
    async fn settle_withdrawal(
        &self,
        settlement: &WithdrawalSettlement,
    ) -> Result<SettlementOutcome, AppError>;

    /// Mark a withdrawal failed and return its reservation to the
    /// available pool (reserved_cents only; amount_cents is untouched).
    /// Atomic.
    async fn fail_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        reason: &str,
    ) -> Result<FailedWithdrawalOutcome, AppError>;
}

/// Exchange-rate provider contract (CoinCap-compatible).
#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    async fn get_rate(&self, crypto: &str, fiat: &str) -> Result<ExchangeRate, AppError>;

    /// Best-effort batch lookup; failed symbols are logged and skipped.
    async fn get_rates(&self, cryptos: &[&str], fiat: &str) -> HashMap<String, ExchangeRate> {
        let mut rates = HashMap::new();
        for crypto in cryptos {
            match self.get_rate(crypto, fiat).await {
                Ok(rate) => {
                    rates.insert((*crypto).to_string(), rate);
                }
                Err(e) => {
                    tracing::warn!(crypto = %crypto, error = %e, "Failed to get exchange rate");
                }
            }
        }
        rates
    }
}

/// Fan-out of settlement results to a user's live subscriber sessions.
///
/// Implementations must not block the caller: offers into the hub are
/// buffered and dropped (with a log) when the hub is saturated.
pub trait UpdateBroadcaster: Send + Sync {
    fn broadcast_deposit_session(&self, session: &DepositSession);
    fn broadcast_withdrawal(&self, withdrawal: &Withdrawal);
    fn broadcast_balance(&self, balance: &Balance);
}
