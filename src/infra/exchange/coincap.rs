//! CoinCap-compatible exchange-rate client.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::{AppError, ConfigError, ExchangeRate, ExchangeRateError, ExchangeRateProvider};

/// Exchange API client configuration
#[derive(Debug, Clone)]
pub struct ExchangeApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Base backoff in seconds; attempt n sleeps base * 2^n, capped at 30s
    pub retry_backoff_base: u64,
}

impl Default for ExchangeApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://rest.coincap.io".to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_base: 2,
        }
    }
}

/// Wire shape of `GET /v3/assets/{id}`
#[derive(Debug, Deserialize)]
struct AssetResponse {
    data: CoinCapAsset,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinCapAsset {
    price_usd: String,
    #[serde(default)]
    change_percent24_hr: Option<String>,
}

/// CoinCap v3 REST client with bounded internal retry.
pub struct CoinCapClient {
    config: ExchangeApiConfig,
    http_client: reqwest::Client,
}

impl CoinCapClient {
    pub fn new(config: ExchangeApiConfig) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Config(ConfigError::Invalid(e.to_string())))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn fetch_asset(&self, asset_id: &str) -> Result<AssetResponse, AppError> {
        let url = format!("{}/v3/assets/{}", self.config.base_url, asset_id);

        let mut request = self.http_client.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::ExchangeRate(ExchangeRateError::Timeout(e.to_string()))
            } else {
                AppError::ExchangeRate(ExchangeRateError::Network(e.to_string()))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExchangeRate(ExchangeRateError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ExchangeRate(ExchangeRateError::Parse(e.to_string())))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_base.max(1);
        let secs = base.saturating_mul(1u64 << attempt.min(8));
        Duration::from_secs(secs.min(30))
    }
}

#[async_trait]
impl ExchangeRateProvider for CoinCapClient {
    async fn get_rate(&self, crypto: &str, fiat: &str) -> Result<ExchangeRate, AppError> {
        let asset_id = coincap_asset_id(crypto);

        let mut attempt = 0;
        let response = loop {
            match self.fetch_asset(asset_id).await {
                Ok(response) => break response,
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        crypto = %crypto,
                        attempt = attempt + 1,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "Exchange rate request failed, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let rate: f64 = response.data.price_usd.parse().map_err(|_| {
            AppError::ExchangeRate(ExchangeRateError::Parse(format!(
                "invalid price format: {}",
                response.data.price_usd
            )))
        })?;
        let change_24hr = response
            .data
            .change_percent24_hr
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0.0);
        let last_updated = chrono::DateTime::from_timestamp_millis(response.timestamp)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339();

        info!(crypto = %crypto, fiat = %fiat, rate = rate, "Fetched exchange rate");

        Ok(ExchangeRate {
            crypto_currency: crypto.to_string(),
            fiat_currency: fiat.to_string(),
            rate,
            change_24hr,
            last_updated,
        })
    }
}

/// Symbol → CoinCap asset id. Unmapped symbols pass through unchanged.
fn coincap_asset_id(symbol: &str) -> &str {
    match symbol {
        "BTC" => "bitcoin",
        "ETH" => "ethereum",
        "LTC" => "litecoin",
        "USDT" => "tether",
        "USDC" => "usd-coin",
        "BNB" => "binance-coin",
        "XRP" => "xrp",
        "ADA" => "cardano",
        "DOGE" => "dogecoin",
        "SOL" => "solana",
        "DOT" => "polkadot",
        "MATIC" => "polygon",
        "AVAX" => "avalanche",
        "BUSD" => "binance-usd",
        "DAI" => "dai",
        "SHIB" => "shiba-inu",
        "TRX" => "tron",
        "UNI" => "uniswap",
        "LINK" => "chainlink",
        "ATOM" => "cosmos",
        other => other,
    }
}
