//! Mock implementations for testing.
//!
//! The mock store applies the same settlement semantics as the Postgres
//! implementation (terminal-status re-check, duplicate-transaction
//! dedup, balance invariants) under a single in-memory lock.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::{
    AppError, Balance, BalanceLog, ChainVerifier, DatabaseError, DepositCheck, DepositProbe,
    DepositSession, DepositSettlement, ExchangeRate, ExchangeRateProvider,
    FailedWithdrawalOutcome, IndexedTransaction, IndexerError, LedgerStore, SessionStatus,
    SettlementOutcome, SolanaCluster, SplToken, Transaction, UpdateBroadcaster, Withdrawal,
    WithdrawalCheck, WithdrawalProbe, WithdrawalSettlement, WithdrawalStatus,
};
use crate::infra::indexer::decimals_for;
use crate::ws::WsMessage;

#[derive(Default)]
struct LedgerState {
    sessions: HashMap<String, DepositSession>,
    withdrawals: HashMap<String, Withdrawal>,
    balances: HashMap<(String, String), Balance>,
    transactions: Vec<Transaction>,
    balance_logs: Vec<BalanceLog>,
}

/// In-memory ledger store for tests
#[derive(Default)]
pub struct MockLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl MockLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, session: DepositSession) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.session_id.clone(), session);
    }

    pub fn insert_withdrawal(&self, withdrawal: Withdrawal) {
        let mut state = self.state.lock().unwrap();
        state
            .withdrawals
            .insert(withdrawal.withdrawal_id.clone(), withdrawal);
    }

    pub fn insert_balance(&self, balance: Balance) {
        let mut state = self.state.lock().unwrap();
        state.balances.insert(
            (balance.user_id.clone(), balance.currency_code.clone()),
            balance,
        );
    }

    pub fn session(&self, session_id: &str) -> Option<DepositSession> {
        self.state.lock().unwrap().sessions.get(session_id).cloned()
    }

    pub fn withdrawal(&self, withdrawal_id: &str) -> Option<Withdrawal> {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .get(withdrawal_id)
            .cloned()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().transactions.clone()
    }

    pub fn balance_logs(&self) -> Vec<BalanceLog> {
        self.state.lock().unwrap().balance_logs.clone()
    }

    fn append_log(
        state: &mut LedgerState,
        user_id: &str,
        component: &str,
        change_cents: i64,
        description: String,
        balance_after_cents: i64,
        transaction_id: Option<String>,
    ) {
        state.balance_logs.push(BalanceLog {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            component: component.to_string(),
            currency_code: "USD".to_string(),
            change_cents,
            change_units: change_cents as f64 / 100.0,
            description,
            timestamp: Utc::now(),
            balance_after_cents,
            transaction_id,
            status: "applied".to_string(),
        });
    }

    fn has_duplicate(state: &LedgerState, record: &Transaction) -> bool {
        state.transactions.iter().any(|t| {
            t.chain_id == record.chain_id
                && t.tx_hash == record.tx_hash
                && t.transaction_type == record.transaction_type
        })
    }
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn load_pending_deposit_sessions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DepositSession>, AppError> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<DepositSession> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn load_pending_withdrawals(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Withdrawal>, AppError> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<Withdrawal> = state
            .withdrawals
            .values()
            .filter(|w| w.status == WithdrawalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn expire_deposit_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<Option<DepositSession>, AppError> {
        let mut state = self.state.lock().unwrap();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Err(AppError::Database(DatabaseError::NotFound(
                session_id.to_string(),
            )));
        };
        if session.status.is_terminal() {
            return Ok(None);
        }
        session.status = SessionStatus::Expired;
        session.error_message = Some(message.to_string());
        session.updated_at = Utc::now();
        Ok(Some(session.clone()))
    }

    async fn get_balance(&self, user_id: &str, currency_code: &str) -> Result<Balance, AppError> {
        let state = self.state.lock().unwrap();
        state
            .balances
            .get(&(user_id.to_string(), currency_code.to_string()))
            .cloned()
            .ok_or_else(|| {
                AppError::Database(DatabaseError::NotFound(format!(
                    "balance for user {} in {}",
                    user_id, currency_code
                )))
            })
    }

    async fn settle_deposit(
        &self,
        settlement: &DepositSettlement,
    ) -> Result<SettlementOutcome, AppError> {
        let mut state = self.state.lock().unwrap();

        let Some(session) = state.sessions.get(&settlement.session.session_id).cloned() else {
            return Err(AppError::Database(DatabaseError::NotFound(
                settlement.session.session_id.clone(),
            )));
        };
        if session.status.is_terminal() {
            return Ok(SettlementOutcome::AlreadySettled);
        }
        if Self::has_duplicate(&state, &settlement.transaction) {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let key = (session.user_id.clone(), "USD".to_string());
        let Some(balance) = state.balances.get(&key).cloned() else {
            return Err(AppError::Database(DatabaseError::NotFound(format!(
                "balance for user {} in USD",
                session.user_id
            ))));
        };

        let new_amount_cents = balance.amount_cents + settlement.usd_amount_cents;
        let current_units: f64 = balance.amount_units.parse().unwrap_or(0.0);
        let new_units_value = current_units + settlement.units_delta;
        if new_amount_cents < 0 || new_units_value < 0.0 {
            return Err(AppError::Invariant(format!(
                "deposit settlement for session {} would produce a negative balance",
                settlement.session.session_id
            )));
        }

        state.transactions.push(settlement.transaction.clone());

        let mut updated = balance;
        updated.amount_cents = new_amount_cents;
        updated.amount_units = format!("{:.18}", new_units_value);
        updated.updated_at = Utc::now();
        state.balances.insert(key, updated.clone());

        Self::append_log(
            &mut state,
            &session.user_id,
            "deposit",
            settlement.usd_amount_cents,
            format!(
                "Credited verified deposit for session {}",
                settlement.session.session_id
            ),
            new_amount_cents,
            Some(settlement.transaction.id.clone()),
        );

        let session = state
            .sessions
            .get_mut(&settlement.session.session_id)
            .expect("session checked above");
        session.status = SessionStatus::Completed;
        session.metadata = settlement.transaction.metadata.clone();
        session.updated_at = Utc::now();

        Ok(SettlementOutcome::Applied { balance: updated })
    }

    async fn settle_withdrawal(
        &self,
        settlement: &WithdrawalSettlement,
    ) -> Result<SettlementOutcome, AppError> {
        let mut state = self.state.lock().unwrap();

        let Some(withdrawal) = state
            .withdrawals
            .get(&settlement.withdrawal.withdrawal_id)
            .cloned()
        else {
            return Err(AppError::Database(DatabaseError::NotFound(
                settlement.withdrawal.withdrawal_id.clone(),
            )));
        };
        if withdrawal.status.is_terminal() {
            return Ok(SettlementOutcome::AlreadySettled);
        }
        if Self::has_duplicate(&state, &settlement.transaction) {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let key = (withdrawal.user_id.clone(), "USD".to_string());
        let Some(balance) = state.balances.get(&key).cloned() else {
            return Err(AppError::Database(DatabaseError::NotFound(format!(
                "balance for user {} in USD",
                withdrawal.user_id
            ))));
        };

        let new_amount_cents = balance.amount_cents - settlement.usd_amount_cents;
        let current_units: f64 = balance.amount_units.parse().unwrap_or(0.0);
        let new_units_value = current_units - settlement.units_delta;
        if new_amount_cents < 0 || new_units_value < 0.0 {
            return Err(AppError::Invariant(format!(
                "insufficient balance for withdrawal {}",
                withdrawal.withdrawal_id
            )));
        }

        let new_reserved_cents = if withdrawal.reservation_released {
            balance.reserved_cents
        } else {
            let released = balance.reserved_cents - withdrawal.amount_reserved_cents;
            if released < 0 {
                return Err(AppError::Invariant(format!(
                    "reservation release for withdrawal {} exceeds reserved balance",
                    withdrawal.withdrawal_id
                )));
            }
            released
        };
        if new_amount_cents < new_reserved_cents {
            return Err(AppError::Invariant(format!(
                "withdrawal {} would leave reserved funds exceeding the balance",
                withdrawal.withdrawal_id
            )));
        }

        state.transactions.push(settlement.transaction.clone());

        let mut updated = balance;
        updated.amount_cents = new_amount_cents;
        updated.amount_units = format!("{:.18}", new_units_value);
        updated.reserved_cents = new_reserved_cents;
        updated.reserved_units = format!("{:.18}", new_reserved_cents as f64 / 100.0);
        updated.updated_at = Utc::now();
        state.balances.insert(key, updated.clone());

        Self::append_log(
            &mut state,
            &withdrawal.user_id,
            "withdrawal",
            -settlement.usd_amount_cents,
            format!("Debited verified withdrawal {}", withdrawal.withdrawal_id),
            new_amount_cents,
            Some(settlement.transaction.id.clone()),
        );

        let now = Utc::now();
        let stored = state
            .withdrawals
            .get_mut(&settlement.withdrawal.withdrawal_id)
            .expect("withdrawal checked above");
        stored.status = WithdrawalStatus::Completed;
        if !stored.reservation_released {
            stored.reservation_released = true;
            stored.reservation_released_at = Some(now);
        }
        stored.updated_at = now;

        Ok(SettlementOutcome::Applied { balance: updated })
    }

    async fn fail_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        reason: &str,
    ) -> Result<FailedWithdrawalOutcome, AppError> {
        let mut state = self.state.lock().unwrap();

        let Some(stored) = state.withdrawals.get(&withdrawal.withdrawal_id).cloned() else {
            return Err(AppError::Database(DatabaseError::NotFound(
                withdrawal.withdrawal_id.clone(),
            )));
        };
        if stored.status.is_terminal() {
            return Ok(FailedWithdrawalOutcome::AlreadySettled);
        }

        let now = Utc::now();
        let mut released_cents = 0;

        if !stored.reservation_released {
            let key = (stored.user_id.clone(), "USD".to_string());
            let Some(balance) = state.balances.get(&key).cloned() else {
                return Err(AppError::Database(DatabaseError::NotFound(format!(
                    "balance for user {} in USD",
                    stored.user_id
                ))));
            };
            let new_reserved_cents = balance.reserved_cents - stored.amount_reserved_cents;
            if new_reserved_cents < 0 {
                return Err(AppError::Invariant(format!(
                    "reservation release for withdrawal {} exceeds reserved balance",
                    stored.withdrawal_id
                )));
            }

            let amount_cents = balance.amount_cents;
            let mut updated = balance;
            updated.reserved_cents = new_reserved_cents;
            updated.reserved_units = format!("{:.18}", new_reserved_cents as f64 / 100.0);
            updated.updated_at = now;
            state.balances.insert(key, updated);

            // amount_cents is untouched by a release
            Self::append_log(
                &mut state,
                &stored.user_id,
                "withdrawal",
                stored.amount_reserved_cents,
                format!(
                    "Released reserved balance for failed withdrawal {}: {}",
                    stored.withdrawal_id, reason
                ),
                amount_cents,
                None,
            );

            released_cents = stored.amount_reserved_cents;
        }

        let entry = state
            .withdrawals
            .get_mut(&withdrawal.withdrawal_id)
            .expect("withdrawal checked above");
        entry.status = WithdrawalStatus::Failed;
        entry.reservation_released = true;
        if entry.reservation_released_at.is_none() {
            entry.reservation_released_at = Some(now);
        }
        entry.updated_at = now;

        Ok(FailedWithdrawalOutcome::Applied {
            withdrawal: entry.clone(),
            released_cents,
        })
    }
}

/// Scripted deposit verification behavior
pub enum DepositBehavior {
    Match(Vec<IndexedTransaction>),
    NoMatch(Vec<IndexedTransaction>),
    TransientError,
    PermanentError,
}

/// Scripted withdrawal verification behavior
pub enum WithdrawalBehavior {
    Match(Box<IndexedTransaction>),
    /// The indexer knows nothing about the hash (empty array)
    NotFound,
    TransientError,
    PermanentError,
}

/// Mock chain verifier with fixed behavior and call counters
pub struct MockChainVerifier {
    deposit_behavior: DepositBehavior,
    withdrawal_behavior: WithdrawalBehavior,
    mint: String,
    pub deposit_calls: AtomicUsize,
    pub withdrawal_calls: AtomicUsize,
}

impl MockChainVerifier {
    pub const USDC_MINT: &'static str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    #[must_use]
    pub fn new(deposit_behavior: DepositBehavior, withdrawal_behavior: WithdrawalBehavior) -> Self {
        Self {
            deposit_behavior,
            withdrawal_behavior,
            mint: Self::USDC_MINT.to_string(),
            deposit_calls: AtomicUsize::new(0),
            withdrawal_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_mint(mut self, mint: impl Into<String>) -> Self {
        self.mint = mint.into();
        self
    }

    pub fn deposit_call_count(&self) -> usize {
        self.deposit_calls.load(Ordering::Relaxed)
    }

    pub fn withdrawal_call_count(&self) -> usize {
        self.withdrawal_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChainVerifier for MockChainVerifier {
    async fn verify_deposit(&self, _probe: &DepositProbe) -> Result<DepositCheck, AppError> {
        self.deposit_calls.fetch_add(1, Ordering::Relaxed);
        match &self.deposit_behavior {
            DepositBehavior::Match(transactions) => Ok(DepositCheck {
                matched: true,
                transactions: transactions.clone(),
            }),
            DepositBehavior::NoMatch(transactions) => Ok(DepositCheck {
                matched: false,
                transactions: transactions.clone(),
            }),
            DepositBehavior::TransientError => Err(AppError::Indexer(IndexerError::Status {
                status: 503,
                body: "Service Unavailable".to_string(),
            })),
            DepositBehavior::PermanentError => Err(AppError::Indexer(IndexerError::Status {
                status: 401,
                body: "Unauthorized".to_string(),
            })),
        }
    }

    async fn verify_withdrawal(
        &self,
        probe: &WithdrawalProbe,
    ) -> Result<WithdrawalCheck, AppError> {
        self.withdrawal_calls.fetch_add(1, Ordering::Relaxed);
        match &self.withdrawal_behavior {
            WithdrawalBehavior::Match(transaction) => {
                let tx = transaction.as_ref().clone();
                let matched = match probe.token {
                    SplToken::Sol => tx.native_transfers.iter().any(|t| {
                        t.to_user_account == probe.to_address
                            && t.amount as f64 / 1e9 >= probe.amount
                    }),
                    _ => tx.token_transfers.iter().any(|t| {
                        t.to_user_account == probe.to_address
                            && t.mint == self.mint
                            && t.token_amount >= probe.amount
                    }),
                };
                Ok(WithdrawalCheck {
                    matched,
                    transaction: Some(tx),
                })
            }
            WithdrawalBehavior::NotFound => Ok(WithdrawalCheck {
                matched: false,
                transaction: None,
            }),
            WithdrawalBehavior::TransientError => Err(AppError::Indexer(IndexerError::Status {
                status: 503,
                body: "Service Unavailable".to_string(),
            })),
            WithdrawalBehavior::PermanentError => Err(AppError::Indexer(IndexerError::Status {
                status: 401,
                body: "Unauthorized".to_string(),
            })),
        }
    }

    fn decimals(&self, cluster: SolanaCluster, token: SplToken) -> Result<u32, AppError> {
        decimals_for(cluster, token)
    }

    fn mint_address(&self, _cluster: SolanaCluster, _token: SplToken) -> Result<String, AppError> {
        Ok(self.mint.clone())
    }
}

/// Fixed-rate exchange provider
pub struct MockExchangeRateProvider {
    rate: f64,
}

impl MockExchangeRateProvider {
    #[must_use]
    pub fn fixed(rate: f64) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl ExchangeRateProvider for MockExchangeRateProvider {
    async fn get_rate(&self, crypto: &str, fiat: &str) -> Result<ExchangeRate, AppError> {
        Ok(ExchangeRate {
            crypto_currency: crypto.to_string(),
            fiat_currency: fiat.to_string(),
            rate: self.rate,
            change_24hr: 0.0,
            last_updated: Utc::now().to_rfc3339(),
        })
    }
}

/// Broadcaster that records every message for assertions
#[derive(Default)]
pub struct RecordingBroadcaster {
    messages: Mutex<Vec<WsMessage>>,
}

impl RecordingBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<WsMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn messages_for_user(&self, user_id: &str) -> Vec<WsMessage> {
        self.messages()
            .into_iter()
            .filter(|m| {
                m.deposit.as_ref().map(|d| d.user_id.as_str()) == Some(user_id)
                    || m.withdrawal.as_ref().map(|w| w.user_id.as_str()) == Some(user_id)
                    || m.balance.as_ref().map(|b| b.user_id.as_str()) == Some(user_id)
            })
            .collect()
    }
}

impl UpdateBroadcaster for RecordingBroadcaster {
    fn broadcast_deposit_session(&self, session: &DepositSession) {
        self.messages
            .lock()
            .unwrap()
            .push(WsMessage::deposit(session.clone()));
    }

    fn broadcast_withdrawal(&self, withdrawal: &Withdrawal) {
        self.messages
            .lock()
            .unwrap()
            .push(WsMessage::withdrawal(withdrawal.clone()));
    }

    fn broadcast_balance(&self, balance: &Balance) {
        self.messages
            .lock()
            .unwrap()
            .push(WsMessage::balance(balance.clone()));
    }
}
