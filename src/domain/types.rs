//! Domain types for deposit sessions, withdrawals, balances and the
//! indexer's transaction view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a deposit session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for an on-chain transfer to the session wallet
    #[default]
    Pending,
    /// A candidate transaction is being settled
    Processing,
    /// Verified and credited
    Completed,
    /// Verification failed permanently
    Failed,
    /// Session outlived the configured timeout
    Expired,
    /// Cancelled by the user or an upstream service
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a withdrawal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    AwaitingAdminReview,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::AwaitingAdminReview => "awaiting_admin_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "awaiting_admin_review" => Ok(Self::AwaitingAdminReview),
            _ => Err(format!("Invalid withdrawal status: {}", s)),
        }
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verification status of a recorded transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Processing,
    Verified,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "verified" => Ok(Self::Verified),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid verification status: {}", s)),
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which processor witnessed and recorded a transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    Internal,
    Pdm,
}

impl ProcessorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Pdm => "pdm",
        }
    }
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a recorded transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            _ => Err(format!("Invalid transaction kind: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SPL tokens the Solana verifier understands.
///
/// Anything else is skipped (not failed): the session stays pending until
/// it times out or an upstream service corrects the currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplToken {
    Sol,
    Usdc,
    Usdt,
}

impl SplToken {
    /// Maps a currency symbol to a supported token. `None` means skip.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "SOL" => Some(Self::Sol),
            "USDC" => Some(Self::Usdc),
            "USDT" => Some(Self::Usdt),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Sol => "SOL",
            Self::Usdc => "USDC",
            Self::Usdt => "USDT",
        }
    }
}

impl std::fmt::Display for SplToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Solana network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolanaCluster {
    MainnetBeta,
    Testnet,
    Devnet,
}

impl SolanaCluster {
    /// The key used in config maps (base URLs, mint addresses).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainnetBeta => "mainnet-beta",
            Self::Testnet => "testnet",
            Self::Devnet => "devnet",
        }
    }

    /// Maps a platform chain id to the cluster it verifies against.
    pub fn from_chain_id(chain_id: &str) -> Option<Self> {
        match chain_id {
            "sol-mainnet" => Some(Self::MainnetBeta),
            "sol-testnet" => Some(Self::Testnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for SolanaCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chain ids delegated to the external PDM processor.
pub const PDM_CHAINS: &[&str] = &["btc-mainnet", "btc-testnet"];

pub fn is_pdm_chain(chain_id: &str) -> bool {
    PDM_CHAINS.contains(&chain_id)
}

/// A user's intent to receive funds at a derived wallet address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepositSession {
    pub id: String,
    /// Business key assigned by the deposit-intent service
    pub session_id: String,
    pub user_id: String,
    /// e.g. `sol-mainnet`
    pub chain_id: String,
    pub network: String,
    /// Expected recipient of the deposit
    pub wallet_address: String,
    /// Required amount in decimal crypto units (e.g. 3.0 USDC)
    pub amount: f64,
    pub crypto_currency: String,
    pub status: SessionStatus,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's intent to send funds out.
///
/// Created by an upstream service that also reserves the fiat balance;
/// the verifier only finalizes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Withdrawal {
    pub id: String,
    pub withdrawal_id: String,
    pub user_id: String,
    pub chain_id: String,
    pub network: String,
    pub crypto_currency: String,
    pub usd_amount_cents: i64,
    /// Decimal string, parsed at settlement time
    pub crypto_amount: String,
    /// Rate captured at reservation time, decimal string
    pub exchange_rate: String,
    pub fee_cents: i64,
    pub to_address: String,
    pub source_wallet_address: String,
    /// Filled by the outbound broadcaster once the tx is sent
    pub tx_hash: Option<String>,
    pub amount_reserved_cents: i64,
    pub reservation_released: bool,
    pub reservation_released_at: Option<DateTime<Utc>>,
    pub status: WithdrawalStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Withdrawal {
    /// A hash is "present" only if non-empty; upstream writers store "".
    pub fn tx_hash(&self) -> Option<&str> {
        self.tx_hash.as_deref().filter(|h| !h.is_empty())
    }
}

/// Per-(user, currency) fiat account. `amount_cents` is authoritative;
/// `amount_units` is a display string. Reserved funds are a subset of
/// the amount: `amount_cents >= reserved_cents >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub id: String,
    pub user_id: String,
    pub currency_code: String,
    pub amount_cents: i64,
    pub amount_units: String,
    pub reserved_cents: i64,
    pub reserved_units: String,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record of a balance mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceLog {
    pub id: String,
    pub user_id: String,
    /// Originating component, e.g. `deposit` or `withdrawal`
    pub component: String,
    pub currency_code: String,
    /// Signed change applied to `amount_cents` or `reserved_cents`
    pub change_cents: i64,
    pub change_units: f64,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub balance_after_cents: i64,
    pub transaction_id: Option<String>,
    pub status: String,
}

/// Immutable record of an on-chain event the verifier witnessed.
///
/// Unique on `(chain_id, tx_hash, transaction_type)`: the same hash may
/// back both a deposit and a withdrawal row, never two of the same kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub deposit_session_id: Option<String>,
    pub withdrawal_id: Option<String>,
    pub chain_id: String,
    pub network: String,
    pub crypto_currency: String,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    /// Decimal string, 18 fractional digits
    pub amount: String,
    pub usd_amount_cents: i64,
    pub exchange_rate: String,
    /// Network fee in SOL, 18-decimal string
    pub fee: String,
    /// Slot for Solana
    pub block_number: i64,
    pub status: VerificationStatus,
    pub confirmations: i32,
    /// Block time reported by the indexer
    pub timestamp: DateTime<Utc>,
    pub verified_at: DateTime<Utc>,
    pub processor: ProcessorKind,
    pub transaction_type: TransactionKind,
    /// Raw indexer record
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A parsed transaction as returned by the Helius enhanced API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexedTransaction {
    pub description: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub source: String,
    /// Lamports
    pub fee: i64,
    pub fee_payer: String,
    pub signature: String,
    pub slot: i64,
    /// Unix seconds
    pub timestamp: i64,
    pub native_transfers: Vec<NativeTransfer>,
    pub token_transfers: Vec<TokenTransfer>,
    pub transaction_error: Option<serde_json::Value>,
}

/// A SOL movement inside an indexed transaction, in lamports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NativeTransfer {
    pub from_user_account: String,
    pub to_user_account: String,
    pub amount: i64,
}

/// An SPL token movement inside an indexed transaction. The amount is
/// already in decimal units (e.g. 3.0 for 3 USDC).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TokenTransfer {
    pub from_user_account: String,
    pub to_user_account: String,
    pub from_token_account: String,
    pub to_token_account: String,
    pub token_amount: f64,
    pub mint: String,
}

/// A crypto→fiat rate snapshot from the exchange-rate provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeRate {
    pub crypto_currency: String,
    pub fiat_currency: String,
    pub rate: f64,
    pub change_24hr: f64,
    pub last_updated: String,
}

/// Inbound PDM webhook body; acknowledged and recorded, never settled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdmWebhookRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub secret: String,
}
