//! Helius enhanced-API client implementing the Solana chain verifier.
//!
//! Two read paths: recent TRANSFER transactions by address (deposit
//! scans) and parsed transactions by hash (withdrawal validation).

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::{
    AppError, ChainVerifier, ConfigError, DepositCheck, DepositProbe, IndexedTransaction,
    IndexerError, SolanaCluster, SplToken, WithdrawalCheck, WithdrawalProbe,
};

const TRANSFER_TYPE: &str = "TRANSFER";
const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Helius client configuration
#[derive(Debug, Clone)]
pub struct HeliusConfig {
    pub api_key: String,
    /// cluster key (`mainnet-beta`, `testnet`) → enhanced-API base URL
    pub base_urls: HashMap<String, String>,
    /// cluster key → token symbol → mint address
    pub mint_addresses: HashMap<String, HashMap<String, String>>,
    pub timeout: Duration,
}

impl Default for HeliusConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_urls: HashMap::new(),
            mint_addresses: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Helius-backed Solana verifier
pub struct HeliusClient {
    config: HeliusConfig,
    http_client: reqwest::Client,
}

impl HeliusClient {
    pub fn new(config: HeliusConfig) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::Config(ConfigError::Invalid(e.to_string())))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn base_url(&self, cluster: SolanaCluster) -> Result<&str, AppError> {
        self.config
            .base_urls
            .get(cluster.as_str())
            .map(String::as_str)
            .ok_or_else(|| AppError::Config(ConfigError::MissingBaseUrl(cluster.to_string())))
    }

    /// Fetches up to 100 recent TRANSFER transactions for an address.
    pub async fn transactions_for_address(
        &self,
        address: &str,
        cluster: SolanaCluster,
    ) -> Result<Vec<IndexedTransaction>, AppError> {
        let base_url = self.base_url(cluster)?;
        let url = format!(
            "{}/v0/addresses/{}/transactions?api-key={}&type=TRANSFER&limit=100",
            base_url, address, self.config.api_key
        );

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                address = %address,
                cluster = %cluster,
                status = %status,
                "Helius API request failed"
            );
            return Err(AppError::Indexer(IndexerError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        let transactions: Vec<IndexedTransaction> = response
            .json()
            .await
            .map_err(|e| AppError::Indexer(IndexerError::Parse(e.to_string())))?;

        info!(
            address = %address,
            cluster = %cluster,
            transaction_count = transactions.len(),
            "Fetched transactions"
        );
        Ok(transactions)
    }

    /// Fetches a single parsed transaction by hash. Helius returns an
    /// array of zero or one records.
    pub async fn transaction_by_hash(
        &self,
        tx_hash: &str,
        cluster: SolanaCluster,
    ) -> Result<Option<IndexedTransaction>, AppError> {
        let base_url = self.base_url(cluster)?;
        let url = format!("{}/v0/transactions?api-key={}", base_url, self.config.api_key);

        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "transactions": [tx_hash] }))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                tx_hash = %tx_hash,
                cluster = %cluster,
                status = %status,
                "Helius API request failed"
            );
            return Err(AppError::Indexer(IndexerError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        let mut transactions: Vec<IndexedTransaction> = response
            .json()
            .await
            .map_err(|e| AppError::Indexer(IndexerError::Parse(e.to_string())))?;

        if transactions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(transactions.swap_remove(0)))
        }
    }
}

#[async_trait]
impl ChainVerifier for HeliusClient {
    async fn verify_deposit(&self, probe: &DepositProbe) -> Result<DepositCheck, AppError> {
        info!(
            address = %probe.address,
            required_amount = probe.required_amount,
            token = %probe.token,
            cluster = %probe.cluster,
            "Starting deposit verification"
        );

        let transactions = self
            .transactions_for_address(&probe.address, probe.cluster)
            .await?;

        let matched = match probe.token {
            SplToken::Sol => find_native_match(&transactions, &probe.address, probe.required_amount),
            token => {
                let decimals = self.decimals(probe.cluster, token)?;
                let mint = self.mint_address(probe.cluster, token)?;
                let required = probe.required_amount as f64 / 10f64.powi(decimals as i32);
                find_token_match(&transactions, &probe.address, &mint, required)
            }
        };

        match matched {
            Some(signature) => {
                info!(
                    transaction = %signature,
                    token = %probe.token,
                    cluster = %probe.cluster,
                    "Matching deposit found"
                );
                Ok(DepositCheck {
                    matched: true,
                    transactions,
                })
            }
            None => {
                debug!(
                    address = %probe.address,
                    required_amount = probe.required_amount,
                    transaction_count = transactions.len(),
                    "No matching transaction found"
                );
                Ok(DepositCheck {
                    matched: false,
                    transactions,
                })
            }
        }
    }

    async fn verify_withdrawal(
        &self,
        probe: &WithdrawalProbe,
    ) -> Result<WithdrawalCheck, AppError> {
        info!(
            tx_hash = %probe.tx_hash,
            to_address = %probe.to_address,
            amount = probe.amount,
            token = %probe.token,
            cluster = %probe.cluster,
            "Starting withdrawal verification"
        );

        let Some(transaction) = self.transaction_by_hash(&probe.tx_hash, probe.cluster).await?
        else {
            warn!(tx_hash = %probe.tx_hash, "No transaction found");
            return Ok(WithdrawalCheck {
                matched: false,
                transaction: None,
            });
        };

        if transaction.tx_type != TRANSFER_TYPE {
            warn!(
                tx_hash = %probe.tx_hash,
                tx_type = %transaction.tx_type,
                "Transaction is not a transfer"
            );
            return Ok(WithdrawalCheck {
                matched: false,
                transaction: Some(transaction),
            });
        }

        let matched = match probe.token {
            // For withdrawals the stored amount is decimal SOL
            SplToken::Sol => transaction.native_transfers.iter().any(|t| {
                t.to_user_account == probe.to_address
                    && t.amount as f64 / LAMPORTS_PER_SOL >= probe.amount
            }),
            token => {
                let mint = self.mint_address(probe.cluster, token)?;
                transaction.token_transfers.iter().any(|t| {
                    t.to_user_account == probe.to_address
                        && t.mint == mint
                        && t.token_amount >= probe.amount
                })
            }
        };

        if matched {
            info!(
                transaction = %transaction.signature,
                token = %probe.token,
                cluster = %probe.cluster,
                "Matching withdrawal found"
            );
        } else {
            warn!(
                tx_hash = %probe.tx_hash,
                to_address = %probe.to_address,
                amount = probe.amount,
                "No matching withdrawal found"
            );
        }

        Ok(WithdrawalCheck {
            matched,
            transaction: Some(transaction),
        })
    }

    fn decimals(&self, cluster: SolanaCluster, token: SplToken) -> Result<u32, AppError> {
        decimals_for(cluster, token)
    }

    /// Missing entries are a permanent configuration error.
    fn mint_address(&self, cluster: SolanaCluster, token: SplToken) -> Result<String, AppError> {
        self.config
            .mint_addresses
            .get(cluster.as_str())
            .and_then(|mints| mints.get(token.symbol()))
            .cloned()
            .ok_or_else(|| {
                AppError::Config(ConfigError::MissingMint {
                    cluster: cluster.to_string(),
                    token: token.to_string(),
                })
            })
    }
}

/// Base-unit decimals: SOL is 9 everywhere; the supported SPL tokens use
/// 6 on mainnet and 9 on testnet deployments.
pub fn decimals_for(cluster: SolanaCluster, token: SplToken) -> Result<u32, AppError> {
    if token == SplToken::Sol {
        return Ok(9);
    }
    match cluster {
        SolanaCluster::MainnetBeta => Ok(6),
        SolanaCluster::Testnet => Ok(9),
        SolanaCluster::Devnet => Err(AppError::Config(ConfigError::Invalid(format!(
            "unsupported cluster for {}: {}",
            token, cluster
        )))),
    }
}

/// First TRANSFER with a native movement of at least `required_lamports`
/// into `address`; returns the matching signature.
fn find_native_match(
    transactions: &[IndexedTransaction],
    address: &str,
    required_lamports: i64,
) -> Option<String> {
    transactions
        .iter()
        .filter(|tx| tx.tx_type == TRANSFER_TYPE)
        .find(|tx| {
            tx.native_transfers
                .iter()
                .any(|t| t.to_user_account == address && t.amount >= required_lamports)
        })
        .map(|tx| tx.signature.clone())
}

/// First TRANSFER with a token movement of at least `required` units of
/// `mint` into `address`; returns the matching signature.
fn find_token_match(
    transactions: &[IndexedTransaction],
    address: &str,
    mint: &str,
    required: f64,
) -> Option<String> {
    transactions
        .iter()
        .filter(|tx| tx.tx_type == TRANSFER_TYPE)
        .find(|tx| {
            tx.token_transfers
                .iter()
                .any(|t| t.to_user_account == address && t.mint == mint && t.token_amount >= required)
        })
        .map(|tx| tx.signature.clone())
}

fn map_reqwest_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Indexer(IndexerError::Timeout(e.to_string()))
    } else {
        AppError::Indexer(IndexerError::Network(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NativeTransfer, TokenTransfer};

    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn native_tx(signature: &str, to: &str, lamports: i64) -> IndexedTransaction {
        IndexedTransaction {
            tx_type: TRANSFER_TYPE.to_string(),
            signature: signature.to_string(),
            native_transfers: vec![NativeTransfer {
                from_user_account: "Sender111".to_string(),
                to_user_account: to.to_string(),
                amount: lamports,
            }],
            ..Default::default()
        }
    }

    fn token_tx(signature: &str, to: &str, mint: &str, amount: f64) -> IndexedTransaction {
        IndexedTransaction {
            tx_type: TRANSFER_TYPE.to_string(),
            signature: signature.to_string(),
            token_transfers: vec![TokenTransfer {
                from_user_account: "Sender111".to_string(),
                to_user_account: to.to_string(),
                token_amount: amount,
                mint: mint.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_native_match_exact_amount() {
        let txs = vec![native_tx("sig1", "Addr1", 1_000_000_000)];
        assert_eq!(
            find_native_match(&txs, "Addr1", 1_000_000_000),
            Some("sig1".to_string())
        );
    }

    #[test]
    fn test_native_match_rejects_underpayment() {
        let txs = vec![native_tx("sig1", "Addr1", 999_999_999)];
        assert_eq!(find_native_match(&txs, "Addr1", 1_000_000_000), None);
    }

    #[test]
    fn test_native_match_rejects_wrong_recipient() {
        let txs = vec![native_tx("sig1", "Addr2", 2_000_000_000)];
        assert_eq!(find_native_match(&txs, "Addr1", 1_000_000_000), None);
    }

    #[test]
    fn test_native_match_skips_non_transfer() {
        let mut tx = native_tx("sig1", "Addr1", 2_000_000_000);
        tx.tx_type = "SWAP".to_string();
        assert_eq!(find_native_match(&[tx], "Addr1", 1_000_000_000), None);
    }

    #[test]
    fn test_token_match_requires_mint_and_amount() {
        let txs = vec![
            token_tx("sig1", "Addr1", "OtherMint111", 3.0),
            token_tx("sig2", "Addr1", USDC_MINT, 3.0),
        ];
        assert_eq!(
            find_token_match(&txs, "Addr1", USDC_MINT, 3.0),
            Some("sig2".to_string())
        );
    }

    #[test]
    fn test_token_match_one_micro_short_is_no_match() {
        let txs = vec![token_tx("sig1", "Addr1", USDC_MINT, 3.0 - 1e-6)];
        assert_eq!(find_token_match(&txs, "Addr1", USDC_MINT, 3.0), None);
    }

    #[test]
    fn test_decimals_table() {
        assert_eq!(
            decimals_for(SolanaCluster::MainnetBeta, SplToken::Sol).unwrap(),
            9
        );
        assert_eq!(
            decimals_for(SolanaCluster::Testnet, SplToken::Sol).unwrap(),
            9
        );
        assert_eq!(
            decimals_for(SolanaCluster::MainnetBeta, SplToken::Usdc).unwrap(),
            6
        );
        assert_eq!(
            decimals_for(SolanaCluster::Testnet, SplToken::Usdt).unwrap(),
            9
        );
        assert!(decimals_for(SolanaCluster::Devnet, SplToken::Usdc).is_err());
    }

    #[test]
    fn test_missing_mint_is_config_error() {
        let client = HeliusClient::new(HeliusConfig::default()).unwrap();
        let err = client
            .mint_address(SolanaCluster::MainnetBeta, SplToken::Usdc)
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Config(ConfigError::MissingMint { .. })
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_missing_base_url_is_config_error() {
        let client = HeliusClient::new(HeliusConfig::default()).unwrap();
        let err = client.base_url(SolanaCluster::MainnetBeta).unwrap_err();
        assert!(matches!(
            err,
            AppError::Config(ConfigError::MissingBaseUrl(_))
        ));
    }
}
