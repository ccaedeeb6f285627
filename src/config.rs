//! Service configuration: a YAML file plus environment overrides.
//!
//! `config.yaml` carries the structured maps (cluster base URLs, mint
//! addresses); secrets and deployment-specific values can override via
//! environment variables (or a `.env` file).

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::app::VerificationConfig;
use crate::domain::{AppError, ConfigError};
use crate::infra::{ExchangeApiConfig, HeliusConfig};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub verification: VerificationSettings,
    pub exchange_api: ExchangeApiSettings,
    pub helius: HeliusSettings,
    /// cluster key → token symbol → mint address
    pub mint_addresses: HashMap<String, HashMap<String, String>>,
    pub jwt: JwtConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Seconds between verification ticks
    pub polling_interval: u64,
    pub session_timeout_hours: i64,
    pub concurrent_workers: usize,
    pub max_retries: u32,
    pub cache_enabled: bool,
    /// Seconds
    pub cache_ttl: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            polling_interval: 30,
            session_timeout_hours: 24,
            concurrent_workers: 10,
            max_retries: 3,
            cache_enabled: false,
            cache_ttl: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeApiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Seconds
    pub timeout: u64,
    pub max_retries: u32,
    /// Seconds; attempt n backs off base * 2^n
    pub retry_backoff_base: u64,
}

impl Default for ExchangeApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://rest.coincap.io".to_string(),
            api_key: None,
            timeout: 10,
            max_retries: 3,
            retry_backoff_base: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeliusSettings {
    pub api_key: String,
    /// cluster key → enhanced-API base URL
    pub base_urls: HashMap<String, String>,
    /// Seconds
    pub timeout: u64,
}

impl Default for HeliusSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_urls: HashMap::new(),
            timeout: 30,
        }
    }
}

/// Carried for the platform frontdoor; the verifier itself does not
/// validate tokens.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
}

impl Config {
    /// Loads `config.yaml` (when present) and applies environment
    /// overrides. A missing file yields defaults, which is enough for
    /// tests; a missing database URL is a startup error.
    pub fn load(path: &str) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let mut config = if Path::new(path).exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| AppError::Config(ConfigError::Invalid(e.to_string())))?;
            serde_yaml::from_str(&raw)
                .map_err(|e| AppError::Config(ConfigError::Invalid(e.to_string())))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(key) = std::env::var("HELIUS_API_KEY") {
            config.helius.api_key = key;
        }
        if let Ok(key) = std::env::var("EXCHANGE_API_KEY") {
            if !key.is_empty() {
                config.exchange_api.api_key = Some(key);
            }
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.jwt.secret = secret;
        }
        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }

        Ok(config)
    }

    pub fn verification_config(&self) -> VerificationConfig {
        VerificationConfig {
            polling_interval: Duration::from_secs(self.verification.polling_interval.max(1)),
            session_timeout_hours: self.verification.session_timeout_hours,
            concurrent_workers: self.verification.concurrent_workers.max(1),
            max_retries: self.verification.max_retries,
        }
    }

    pub fn helius_config(&self) -> HeliusConfig {
        HeliusConfig {
            api_key: self.helius.api_key.clone(),
            base_urls: self.helius.base_urls.clone(),
            mint_addresses: self.mint_addresses.clone(),
            timeout: Duration::from_secs(self.helius.timeout.max(1)),
        }
    }

    pub fn exchange_config(&self) -> ExchangeApiConfig {
        ExchangeApiConfig {
            base_url: self.exchange_api.base_url.clone(),
            api_key: self.exchange_api.api_key.clone(),
            timeout: Duration::from_secs(self.exchange_api.timeout.max(1)),
            max_retries: self.exchange_api.max_retries,
            retry_backoff_base: self.exchange_api.retry_backoff_base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_parsing_with_maps() {
        let raw = r#"
server:
  host: 127.0.0.1
  port: 9000
verification:
  polling_interval: 15
  session_timeout_hours: 48
helius:
  api_key: test-key
  base_urls:
    mainnet-beta: https://api.helius.xyz
    testnet: https://api-testnet.helius.xyz
mint_addresses:
  mainnet-beta:
    USDC: EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v
    USDT: Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.verification.polling_interval, 15);
        assert_eq!(config.verification.session_timeout_hours, 48);
        // untouched sections keep defaults
        assert_eq!(config.verification.concurrent_workers, 10);
        assert_eq!(
            config.helius.base_urls.get("mainnet-beta").unwrap(),
            "https://api.helius.xyz"
        );
        assert_eq!(
            config
                .mint_addresses
                .get("mainnet-beta")
                .and_then(|m| m.get("USDC"))
                .unwrap(),
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
        );
    }

    #[test]
    fn test_verification_config_conversion() {
        let config = Config::default();
        let vc = config.verification_config();
        assert_eq!(vc.polling_interval, Duration::from_secs(30));
        assert_eq!(vc.session_timeout_hours, 24);
        assert_eq!(vc.concurrent_workers, 10);
        assert_eq!(vc.max_retries, 3);
    }

    #[test]
    fn test_zero_polling_interval_is_clamped() {
        let mut config = Config::default();
        config.verification.polling_interval = 0;
        assert_eq!(
            config.verification_config().polling_interval,
            Duration::from_secs(1)
        );
    }
}
