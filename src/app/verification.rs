//! The verification loop: periodic driver, per-chain routing and the
//! bounded worker fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};

use crate::app::retry;
use crate::app::settlement::SettlementEngine;
use crate::domain::{
    AppError, ChainVerifier, ConfigError, DepositProbe, DepositSession, ExchangeRateProvider,
    LedgerStore, SolanaCluster, SplToken, UpdateBroadcaster, Withdrawal, WithdrawalProbe,
    is_pdm_chain,
};

/// Page size for the pending-record drain.
const PAGE_SIZE: i64 = 100;

/// Verification loop configuration
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Seconds between ticks; also the backoff base
    pub polling_interval: Duration,
    pub session_timeout_hours: i64,
    /// Bound on concurrent verifications per chain bucket
    pub concurrent_workers: usize,
    pub max_retries: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            session_timeout_hours: 24,
            concurrent_workers: 10,
            max_retries: retry::MAX_RETRIES,
        }
    }
}

/// Per-chain verification capability.
///
/// Chains the service cannot verify yet are explicit variants so the
/// router logs and skips them instead of silently dropping records.
#[derive(Clone)]
pub enum ChainWorker {
    Solana(Arc<dyn ChainVerifier>),
    NotImplemented(&'static str),
}

/// Maps chain ids to their verification workers.
pub struct ChainRouter {
    routes: HashMap<&'static str, ChainWorker>,
}

impl ChainRouter {
    #[must_use]
    pub fn new(solana: Arc<dyn ChainVerifier>) -> Self {
        let mut routes: HashMap<&'static str, ChainWorker> = HashMap::new();
        routes.insert("sol-mainnet", ChainWorker::Solana(Arc::clone(&solana)));
        routes.insert("sol-testnet", ChainWorker::Solana(solana));
        routes.insert("eth-mainnet", ChainWorker::NotImplemented("Ethereum"));
        routes.insert("eth-testnet", ChainWorker::NotImplemented("Ethereum"));
        routes.insert("tron-mainnet", ChainWorker::NotImplemented("Tron"));
        Self { routes }
    }

    pub fn route(&self, chain_id: &str) -> Option<&ChainWorker> {
        self.routes.get(chain_id)
    }
}

/// The long-running verification driver.
pub struct VerificationService {
    store: Arc<dyn LedgerStore>,
    router: ChainRouter,
    exchange: Arc<dyn ExchangeRateProvider>,
    settlement: SettlementEngine,
    broadcaster: Arc<dyn UpdateBroadcaster>,
    config: VerificationConfig,
    shutdown: watch::Receiver<bool>,
}

impl VerificationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        router: ChainRouter,
        exchange: Arc<dyn ExchangeRateProvider>,
        broadcaster: Arc<dyn UpdateBroadcaster>,
        config: VerificationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let settlement = SettlementEngine::new(Arc::clone(&store), Arc::clone(&broadcaster));
        Self {
            store,
            router,
            exchange,
            settlement,
            broadcaster,
            config,
            shutdown,
        }
    }

    /// Runs until shutdown. Each tick drains pending sessions and
    /// withdrawals; per-record errors are logged, never fatal.
    pub async fn run(self: Arc<Self>) {
        info!("Starting transaction verification service");

        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Transaction verification service stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = Arc::clone(&self).process_pending_sessions().await {
                        error!(error = %e, "Failed to process pending deposit sessions");
                    }
                    if let Err(e) = Arc::clone(&self).process_pending_withdrawals().await {
                        error!(error = %e, "Failed to process pending withdrawals");
                    }
                }
            }
        }
    }

    /// Drains pending deposit sessions, expires stale ones and fans the
    /// rest out per chain. Bucket dispatch is fire-and-forget; the
    /// settlement layer makes duplicate pickups across ticks harmless.
    #[instrument(skip(self))]
    pub async fn process_pending_sessions(self: Arc<Self>) -> Result<(), AppError> {
        let mut offset = 0;
        let mut buckets: HashMap<String, Vec<DepositSession>> = HashMap::new();

        loop {
            let sessions = self
                .store
                .load_pending_deposit_sessions(PAGE_SIZE, offset)
                .await?;
            if sessions.is_empty() {
                break;
            }

            for session in sessions {
                if is_pdm_chain(&session.chain_id) {
                    info!(
                        session_id = %session.session_id,
                        chain_id = %session.chain_id,
                        "Skipping verification for PDM chain"
                    );
                    continue;
                }

                let age = Utc::now() - session.created_at;
                if age >= chrono::Duration::hours(self.config.session_timeout_hours) {
                    match self
                        .store
                        .expire_deposit_session(&session.session_id, "Session expired")
                        .await
                    {
                        Ok(Some(expired)) => {
                            self.broadcaster.broadcast_deposit_session(&expired);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(
                                session_id = %session.session_id,
                                error = %e,
                                "Failed to mark session as expired"
                            );
                        }
                    }
                    continue;
                }

                buckets.entry(session.chain_id.clone()).or_default().push(session);
            }

            offset += PAGE_SIZE;
        }

        for (chain_id, sessions) in buckets {
            match self.router.route(&chain_id) {
                Some(ChainWorker::Solana(verifier)) => {
                    let service = Arc::clone(&self);
                    let verifier = Arc::clone(verifier);
                    tokio::spawn(async move {
                        service.process_solana_sessions(verifier, sessions).await;
                    });
                }
                Some(ChainWorker::NotImplemented(chain)) => {
                    for session in &sessions {
                        warn!(
                            session_id = %session.session_id,
                            chain_id = %session.chain_id,
                            "{} session verification not implemented yet",
                            chain
                        );
                    }
                }
                None => {
                    warn!(chain_id = %chain_id, "No processor available for chain");
                }
            }
        }

        Ok(())
    }

    /// Drains pending withdrawals, applying the empty-hash grace window,
    /// and fans the rest out per chain.
    #[instrument(skip(self))]
    pub async fn process_pending_withdrawals(self: Arc<Self>) -> Result<(), AppError> {
        let mut offset = 0;
        let mut buckets: HashMap<String, Vec<Withdrawal>> = HashMap::new();
        let grace_window =
            chrono::Duration::from_std(self.config.polling_interval * 2).unwrap_or_default();

        loop {
            let withdrawals = self
                .store
                .load_pending_withdrawals(PAGE_SIZE, offset)
                .await?;
            if withdrawals.is_empty() {
                break;
            }

            for withdrawal in withdrawals {
                if is_pdm_chain(&withdrawal.chain_id) {
                    info!(
                        withdrawal_id = %withdrawal.withdrawal_id,
                        chain_id = %withdrawal.chain_id,
                        "Skipping verification for PDM chain"
                    );
                    continue;
                }

                if withdrawal.tx_hash().is_none() {
                    let age = Utc::now() - withdrawal.created_at;
                    if age < grace_window {
                        info!(
                            withdrawal_id = %withdrawal.withdrawal_id,
                            "No transaction hash for withdrawal, too early to verify"
                        );
                    } else {
                        warn!(
                            withdrawal_id = %withdrawal.withdrawal_id,
                            "No transaction hash for withdrawal, marking as failed"
                        );
                        if let Err(e) = self
                            .settlement
                            .fail_withdrawal(&withdrawal, "No transaction hash provided")
                            .await
                        {
                            error!(
                                withdrawal_id = %withdrawal.withdrawal_id,
                                error = %e,
                                "Failed to mark withdrawal as failed"
                            );
                        }
                    }
                    continue;
                }

                buckets
                    .entry(withdrawal.chain_id.clone())
                    .or_default()
                    .push(withdrawal);
            }

            offset += PAGE_SIZE;
        }

        for (chain_id, withdrawals) in buckets {
            match self.router.route(&chain_id) {
                Some(ChainWorker::Solana(verifier)) => {
                    let service = Arc::clone(&self);
                    let verifier = Arc::clone(verifier);
                    tokio::spawn(async move {
                        service
                            .process_solana_withdrawals(verifier, withdrawals)
                            .await;
                    });
                }
                Some(ChainWorker::NotImplemented(chain)) => {
                    for withdrawal in &withdrawals {
                        warn!(
                            withdrawal_id = %withdrawal.withdrawal_id,
                            chain_id = %withdrawal.chain_id,
                            "{} withdrawal verification not implemented yet",
                            chain
                        );
                    }
                }
                None => {
                    warn!(chain_id = %chain_id, "No processor available for chain");
                }
            }
        }

        Ok(())
    }

    /// Verifies a bucket of Solana sessions with bounded concurrency.
    /// Returns only after every verification in the bucket finished.
    pub async fn process_solana_sessions(
        self: Arc<Self>,
        verifier: Arc<dyn ChainVerifier>,
        sessions: Vec<DepositSession>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_workers));
        let mut workers = JoinSet::new();

        for session in sessions {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let service = Arc::clone(&self);
            let verifier = Arc::clone(&verifier);
            workers.spawn(async move {
                let _permit = permit;
                if let Err(e) = service.verify_solana_session(&verifier, &session).await {
                    error!(
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to verify Solana session"
                    );
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }

    /// Verifies a bucket of Solana withdrawals with bounded concurrency.
    pub async fn process_solana_withdrawals(
        self: Arc<Self>,
        verifier: Arc<dyn ChainVerifier>,
        withdrawals: Vec<Withdrawal>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_workers));
        let mut workers = JoinSet::new();

        for withdrawal in withdrawals {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let service = Arc::clone(&self);
            let verifier = Arc::clone(&verifier);
            workers.spawn(async move {
                let _permit = permit;
                if let Err(e) = service
                    .verify_solana_withdrawal(&verifier, &withdrawal)
                    .await
                {
                    error!(
                        withdrawal_id = %withdrawal.withdrawal_id,
                        error = %e,
                        "Failed to verify Solana withdrawal"
                    );
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }

    /// One deposit session: map token and cluster, fetch the rate, probe
    /// the indexer under the retry policy, settle on a match. A no-match
    /// after all retries leaves the session pending for the next tick.
    #[instrument(skip(self, verifier, session), fields(session_id = %session.session_id))]
    pub async fn verify_solana_session(
        &self,
        verifier: &Arc<dyn ChainVerifier>,
        session: &DepositSession,
    ) -> Result<(), AppError> {
        let Some(token) = SplToken::from_symbol(&session.crypto_currency) else {
            info!(
                session_id = %session.session_id,
                crypto_currency = %session.crypto_currency,
                "Skipping verification for unsupported crypto currency"
            );
            return Ok(());
        };

        let cluster = SolanaCluster::from_chain_id(&session.chain_id).ok_or_else(|| {
            AppError::Config(ConfigError::InvalidChainId(session.chain_id.clone()))
        })?;

        let decimals = verifier.decimals(cluster, token)?;
        let rate = self
            .exchange
            .get_rate(&session.crypto_currency, "USD")
            .await?;

        let required_amount = session.amount;
        let probe = DepositProbe {
            address: session.wallet_address.clone(),
            required_amount: (required_amount * 10f64.powi(decimals as i32)) as i64,
            token,
            cluster,
        };

        let mut shutdown = self.shutdown.clone();
        for attempt in 0..=self.config.max_retries {
            match verifier.verify_deposit(&probe).await {
                Ok(check) if check.matched => {
                    let target_mint = match token {
                        SplToken::Sol => None,
                        _ => Some(verifier.mint_address(cluster, token)?),
                    };
                    return self
                        .settlement
                        .settle_verified_deposit(
                            session,
                            &check.transactions,
                            token,
                            required_amount,
                            target_mint.as_deref(),
                            decimals,
                            rate.rate,
                        )
                        .await;
                }
                Ok(_) => {
                    info!(
                        session_id = %session.session_id,
                        attempt,
                        "No matching transaction found"
                    );
                    if attempt == self.config.max_retries {
                        return Ok(());
                    }
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        session_id = %session.session_id,
                        attempt,
                        error = %e,
                        "Transient error during verification, retrying"
                    );
                }
                Err(e) => return Err(e),
            }

            let delay = retry::backoff_delay(self.config.polling_interval, attempt);
            if !retry::sleep_unless_shutdown(delay, &mut shutdown).await {
                return Ok(());
            }
        }

        Ok(())
    }

    /// One withdrawal: validate the known hash against the expected
    /// recipient, token and amount. Exhausted retries or a permanent
    /// error flip the withdrawal to failed and release its reservation.
    #[instrument(skip(self, verifier, withdrawal), fields(withdrawal_id = %withdrawal.withdrawal_id))]
    pub async fn verify_solana_withdrawal(
        &self,
        verifier: &Arc<dyn ChainVerifier>,
        withdrawal: &Withdrawal,
    ) -> Result<(), AppError> {
        let Some(tx_hash) = withdrawal.tx_hash() else {
            warn!(
                withdrawal_id = %withdrawal.withdrawal_id,
                "No transaction hash for withdrawal, verification skipped"
            );
            return Ok(());
        };

        let Some(token) = SplToken::from_symbol(&withdrawal.crypto_currency) else {
            info!(
                withdrawal_id = %withdrawal.withdrawal_id,
                crypto_currency = %withdrawal.crypto_currency,
                "Skipping verification for unsupported crypto currency"
            );
            return Ok(());
        };

        let cluster = SolanaCluster::from_chain_id(&withdrawal.chain_id).ok_or_else(|| {
            AppError::Config(ConfigError::InvalidChainId(withdrawal.chain_id.clone()))
        })?;

        let amount: f64 = withdrawal.crypto_amount.parse().map_err(|_| {
            AppError::Validation(crate::domain::ValidationError::InvalidField {
                field: "crypto_amount".to_string(),
                message: format!("failed to parse {}", withdrawal.crypto_amount),
            })
        })?;

        let probe = WithdrawalProbe {
            tx_hash: tx_hash.to_string(),
            to_address: withdrawal.to_address.clone(),
            amount,
            token,
            cluster,
        };

        let mut shutdown = self.shutdown.clone();
        for attempt in 0..=self.config.max_retries {
            match verifier.verify_withdrawal(&probe).await {
                Ok(check) if check.matched => {
                    let Some(transaction) = check.transaction else {
                        return Err(AppError::Invariant(format!(
                            "verifier matched withdrawal {} without a transaction",
                            withdrawal.withdrawal_id
                        )));
                    };
                    return self
                        .settlement
                        .settle_verified_withdrawal(withdrawal, &transaction)
                        .await;
                }
                Ok(_) => {
                    info!(
                        withdrawal_id = %withdrawal.withdrawal_id,
                        attempt,
                        "No matching transaction found"
                    );
                    if attempt == self.config.max_retries {
                        return self
                            .settlement
                            .fail_withdrawal(
                                withdrawal,
                                "No matching transaction found after retries",
                            )
                            .await;
                    }
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        withdrawal_id = %withdrawal.withdrawal_id,
                        attempt,
                        error = %e,
                        "Transient error during withdrawal verification, retrying"
                    );
                }
                Err(e) => {
                    return self
                        .settlement
                        .fail_withdrawal(
                            withdrawal,
                            &format!(
                                "Failed to verify after {} attempts: {}",
                                attempt + 1,
                                e
                            ),
                        )
                        .await;
                }
            }

            let delay = retry::backoff_delay(self.config.polling_interval, attempt);
            if !retry::sleep_unless_shutdown(delay, &mut shutdown).await {
                return Ok(());
            }
        }

        Ok(())
    }
}

/// Spawns the verification loop, returning its handle and the shutdown
/// sender.
pub fn spawn_verification_loop(
    store: Arc<dyn LedgerStore>,
    router: ChainRouter,
    exchange: Arc<dyn ExchangeRateProvider>,
    broadcaster: Arc<dyn UpdateBroadcaster>,
    config: VerificationConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Arc::new(VerificationService::new(
        store,
        router,
        exchange,
        broadcaster,
        config,
        shutdown_rx,
    ));
    let handle = tokio::spawn(service.run());
    (handle, shutdown_tx)
}
