//! Ledger settlement: the durable side effects after a verification.
//!
//! Three paths: credit a verified deposit, debit a verified withdrawal,
//! return the reservation of a failed withdrawal. Each delegates its
//! writes to one atomic store commit and broadcasts in commit order.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::currency;
use crate::domain::{
    AppError, DepositSession, DepositSettlement, FailedWithdrawalOutcome, IndexedTransaction,
    LedgerStore, ProcessorKind, SessionStatus, SettlementOutcome, SplToken, Transaction,
    TransactionKind, UpdateBroadcaster, ValidationError, VerificationStatus, Withdrawal,
    WithdrawalSettlement, WithdrawalStatus,
};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// The transfer a deposit verification matched, extracted from the
/// indexer's transaction batch.
#[derive(Debug, Clone)]
pub struct MatchedDeposit {
    pub transaction: IndexedTransaction,
    /// Decimal units received
    pub amount: f64,
    pub from_address: String,
}

/// Re-scans an indexer batch for the transfer that satisfied a deposit.
///
/// Mirrors the verifier's match rules; `target_mint` must be given for
/// SPL tokens and is ignored for SOL.
pub fn find_matched_deposit(
    transactions: &[IndexedTransaction],
    wallet_address: &str,
    token: SplToken,
    required_amount: f64,
    target_mint: Option<&str>,
    decimals: u32,
) -> Option<MatchedDeposit> {
    for tx in transactions {
        if tx.tx_type != "TRANSFER" {
            continue;
        }
        match token {
            SplToken::Sol => {
                for transfer in &tx.native_transfers {
                    let adjusted = transfer.amount as f64 / 10f64.powi(decimals as i32);
                    if transfer.to_user_account == wallet_address && adjusted >= required_amount {
                        return Some(MatchedDeposit {
                            transaction: tx.clone(),
                            amount: adjusted,
                            from_address: deposit_from_address(tx, token),
                        });
                    }
                }
            }
            _ => {
                let Some(mint) = target_mint else {
                    return None;
                };
                for transfer in &tx.token_transfers {
                    if transfer.to_user_account == wallet_address
                        && transfer.mint == mint
                        && transfer.token_amount >= required_amount
                    {
                        return Some(MatchedDeposit {
                            transaction: tx.clone(),
                            amount: transfer.token_amount,
                            from_address: deposit_from_address(tx, token),
                        });
                    }
                }
            }
        }
    }
    None
}

/// First sender on a transfer with a non-empty recipient.
fn deposit_from_address(tx: &IndexedTransaction, token: SplToken) -> String {
    match token {
        SplToken::Sol => tx
            .native_transfers
            .iter()
            .find(|t| !t.to_user_account.is_empty())
            .map(|t| t.from_user_account.clone())
            .unwrap_or_default(),
        _ => tx
            .token_transfers
            .iter()
            .find(|t| !t.to_user_account.is_empty())
            .map(|t| t.from_user_account.clone())
            .unwrap_or_default(),
    }
}

/// Post-verification settlement engine.
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    broadcaster: Arc<dyn UpdateBroadcaster>,
}

impl SettlementEngine {
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, broadcaster: Arc<dyn UpdateBroadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Credits a verified deposit: transaction row, balance credit,
    /// session completion, broadcasts.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, session, transactions), fields(session_id = %session.session_id))]
    pub async fn settle_verified_deposit(
        &self,
        session: &DepositSession,
        transactions: &[IndexedTransaction],
        token: SplToken,
        required_amount: f64,
        target_mint: Option<&str>,
        decimals: u32,
        exchange_rate: f64,
    ) -> Result<(), AppError> {
        let Some(matched) = find_matched_deposit(
            transactions,
            &session.wallet_address,
            token,
            required_amount,
            target_mint,
            decimals,
        ) else {
            return Err(AppError::Invariant(format!(
                "no matching transaction found despite verification for session {}",
                session.session_id
            )));
        };

        let usd_amount_cents = currency::crypto_to_usd_cents(matched.amount, exchange_rate);
        let metadata = serde_json::to_value(&matched.transaction)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let now = Utc::now();

        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            deposit_session_id: Some(session.session_id.clone()),
            withdrawal_id: None,
            chain_id: session.chain_id.clone(),
            network: session.network.clone(),
            crypto_currency: session.crypto_currency.clone(),
            tx_hash: matched.transaction.signature.clone(),
            from_address: matched.from_address.clone(),
            to_address: session.wallet_address.clone(),
            amount: format!("{:.18}", matched.amount),
            usd_amount_cents,
            exchange_rate: format!("{:.6}", exchange_rate),
            fee: format!("{:.18}", matched.transaction.fee as f64 / LAMPORTS_PER_SOL),
            block_number: matched.transaction.slot,
            status: VerificationStatus::Verified,
            confirmations: 1,
            timestamp: chrono::DateTime::from_timestamp(matched.transaction.timestamp, 0)
                .unwrap_or(now),
            verified_at: now,
            processor: ProcessorKind::Internal,
            transaction_type: TransactionKind::Deposit,
            metadata: metadata.clone(),
            created_at: now,
            updated_at: now,
        };

        let settlement = DepositSettlement {
            session: session.clone(),
            transaction,
            usd_amount_cents,
            units_delta: matched.amount * exchange_rate,
        };

        match self.store.settle_deposit(&settlement).await? {
            SettlementOutcome::Applied { balance } => {
                info!(
                    session_id = %session.session_id,
                    transaction_hash = %matched.transaction.signature,
                    amount = matched.amount,
                    usd_amount_cents,
                    "Transaction verified, session completed, and balance updated"
                );

                let mut completed = session.clone();
                completed.status = SessionStatus::Completed;
                completed.metadata = metadata;
                completed.updated_at = balance.updated_at;

                self.broadcaster.broadcast_deposit_session(&completed);
                self.broadcaster.broadcast_balance(&balance);
                Ok(())
            }
            SettlementOutcome::AlreadySettled => {
                info!(
                    session_id = %session.session_id,
                    "Deposit already settled by an earlier pickup"
                );
                Ok(())
            }
        }
    }

    /// Debits a verified withdrawal and releases its reservation.
    #[instrument(skip(self, withdrawal, transaction), fields(withdrawal_id = %withdrawal.withdrawal_id))]
    pub async fn settle_verified_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        transaction: &IndexedTransaction,
    ) -> Result<(), AppError> {
        let amount: f64 = withdrawal.crypto_amount.parse().map_err(|_| {
            AppError::Validation(ValidationError::InvalidField {
                field: "crypto_amount".to_string(),
                message: format!("failed to parse {}", withdrawal.crypto_amount),
            })
        })?;
        let exchange_rate: f64 = withdrawal.exchange_rate.parse().map_err(|_| {
            AppError::Validation(ValidationError::InvalidField {
                field: "exchange_rate".to_string(),
                message: format!("failed to parse {}", withdrawal.exchange_rate),
            })
        })?;

        let metadata = serde_json::to_value(transaction)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let now = Utc::now();

        let record = Transaction {
            id: Uuid::new_v4().to_string(),
            deposit_session_id: None,
            withdrawal_id: Some(withdrawal.withdrawal_id.clone()),
            chain_id: withdrawal.chain_id.clone(),
            network: withdrawal.network.clone(),
            crypto_currency: withdrawal.crypto_currency.clone(),
            tx_hash: transaction.signature.clone(),
            from_address: withdrawal.source_wallet_address.clone(),
            to_address: withdrawal.to_address.clone(),
            amount: withdrawal.crypto_amount.clone(),
            usd_amount_cents: withdrawal.usd_amount_cents,
            exchange_rate: withdrawal.exchange_rate.clone(),
            fee: format!("{:.18}", transaction.fee as f64 / LAMPORTS_PER_SOL),
            block_number: transaction.slot,
            status: VerificationStatus::Verified,
            confirmations: 1,
            timestamp: chrono::DateTime::from_timestamp(transaction.timestamp, 0).unwrap_or(now),
            verified_at: now,
            processor: ProcessorKind::Internal,
            transaction_type: TransactionKind::Withdrawal,
            metadata,
            created_at: now,
            updated_at: now,
        };

        let settlement = WithdrawalSettlement {
            withdrawal: withdrawal.clone(),
            transaction: record,
            usd_amount_cents: withdrawal.usd_amount_cents,
            units_delta: amount * exchange_rate,
        };

        match self.store.settle_withdrawal(&settlement).await? {
            SettlementOutcome::Applied { balance } => {
                info!(
                    withdrawal_id = %withdrawal.withdrawal_id,
                    transaction_hash = %transaction.signature,
                    crypto_amount = amount,
                    usd_amount_cents = withdrawal.usd_amount_cents,
                    "Withdrawal verified, transaction recorded, and balance updated"
                );

                let mut completed = withdrawal.clone();
                completed.status = WithdrawalStatus::Completed;
                if !completed.reservation_released {
                    completed.reservation_released = true;
                    completed.reservation_released_at = Some(balance.updated_at);
                }
                completed.updated_at = balance.updated_at;

                self.broadcaster.broadcast_withdrawal(&completed);
                self.broadcaster.broadcast_balance(&balance);
                Ok(())
            }
            SettlementOutcome::AlreadySettled => {
                info!(
                    withdrawal_id = %withdrawal.withdrawal_id,
                    "Withdrawal already settled by an earlier pickup"
                );
                Ok(())
            }
        }
    }

    /// Marks a withdrawal failed and returns its reservation to the
    /// available pool.
    #[instrument(skip(self, withdrawal), fields(withdrawal_id = %withdrawal.withdrawal_id))]
    pub async fn fail_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        reason: &str,
    ) -> Result<(), AppError> {
        match self.store.fail_withdrawal(withdrawal, reason).await? {
            FailedWithdrawalOutcome::Applied {
                withdrawal: failed,
                released_cents,
            } => {
                info!(
                    withdrawal_id = %failed.withdrawal_id,
                    reason = %reason,
                    released_cents,
                    "Withdrawal marked as failed"
                );
                self.broadcaster.broadcast_withdrawal(&failed);
                Ok(())
            }
            FailedWithdrawalOutcome::AlreadySettled => {
                warn!(
                    withdrawal_id = %withdrawal.withdrawal_id,
                    "Withdrawal already in a terminal state, skipping failure transition"
                );
                Ok(())
            }
        }
    }
}
