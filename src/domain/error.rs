//! Central error taxonomy with transient/permanent classification for
//! the retry policy.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("indexer error: {0}")]
    Indexer(#[from] IndexerError),

    #[error("exchange rate error: {0}")]
    ExchangeRate(#[from] ExchangeRateError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A settlement precondition failed: negative balance, duplicate
    /// transaction, broken monotonicity. Never retried.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),
}

/// Chain-indexer transport and protocol failures
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse JSON response: {0}")]
    Parse(String),
}

/// Exchange-rate provider failures
#[derive(Debug, Error)]
pub enum ExchangeRateError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse rate response: {0}")]
    Parse(String),
}

/// Malformed stored data (amounts, rates, addresses)
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid field {field}: {message}")]
    InvalidField { field: String, message: String },
}

/// Missing or inconsistent configuration for an otherwise supported
/// (cluster, token) pair
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no base URL configured for cluster {0}")]
    MissingBaseUrl(String),

    #[error("no mint address configured for token {token} on cluster {cluster}")]
    MissingMint { cluster: String, token: String },

    #[error("invalid chain id: {0}")]
    InvalidChainId(String),

    #[error("{0}")]
    Invalid(String),
}

impl AppError {
    /// Whether a retry may succeed. HTTP 429 and 5xx, timeouts and plain
    /// network failures are transient; auth/format rejections, parse
    /// failures and configuration gaps are permanent. Ambiguous errors
    /// default to transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Indexer(e) => match e {
                IndexerError::Timeout(_) | IndexerError::Network(_) => true,
                IndexerError::Status { status, .. } => *status == 429 || *status >= 500,
                IndexerError::Parse(_) => false,
            },
            Self::ExchangeRate(e) => match e {
                ExchangeRateError::Timeout(_) | ExchangeRateError::Network(_) => true,
                ExchangeRateError::Status { status, .. } => *status == 429 || *status >= 500,
                ExchangeRateError::Parse(_) => false,
            },
            Self::Config(_) | Self::Validation(_) | Self::Invariant(_) | Self::NotSupported(_) => {
                false
            }
            // Storage errors are retried on the next tick, not inline
            Self::Database(_) => false,
        }
    }
}
