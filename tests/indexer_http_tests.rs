//! HTTP-level tests for the Helius and CoinCap clients against a
//! wiremock server.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use transaction_verifier::domain::{
    AppError, ChainVerifier, DepositProbe, ExchangeRateProvider, IndexerError, SolanaCluster,
    SplToken, WithdrawalProbe,
};
use transaction_verifier::infra::{CoinCapClient, ExchangeApiConfig, HeliusClient, HeliusConfig};

const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

fn helius_config(base_url: &str) -> HeliusConfig {
    let mut base_urls = HashMap::new();
    base_urls.insert("mainnet-beta".to_string(), base_url.to_string());

    let mut mainnet_mints = HashMap::new();
    mainnet_mints.insert("USDC".to_string(), USDC_MINT.to_string());
    let mut mint_addresses = HashMap::new();
    mint_addresses.insert("mainnet-beta".to_string(), mainnet_mints);

    HeliusConfig {
        api_key: "test-key".to_string(),
        base_urls,
        mint_addresses,
        timeout: Duration::from_secs(5),
    }
}

fn transfer_payload(signature: &str, to: &str, amount: f64) -> serde_json::Value {
    json!({
        "description": "transfer",
        "type": "TRANSFER",
        "source": "SOLANA_PROGRAM_LIBRARY",
        "fee": 5000,
        "feePayer": "Sender111",
        "signature": signature,
        "slot": 242817305,
        "timestamp": 1715700000,
        "nativeTransfers": [],
        "tokenTransfers": [{
            "fromUserAccount": "Sender111",
            "toUserAccount": to,
            "fromTokenAccount": "SenderAta111",
            "toTokenAccount": "RecvAta111",
            "tokenAmount": amount,
            "mint": USDC_MINT
        }],
        "transactionError": null
    })
}

#[tokio::test]
async fn test_verify_deposit_matches_token_transfer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v0/addresses/AddrA/transactions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([transfer_payload(
                "sig_1", "AddrA", 3.0
            )])),
        )
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let check = client
        .verify_deposit(&DepositProbe {
            address: "AddrA".to_string(),
            required_amount: 3_000_000,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap();

    assert!(check.matched);
    assert_eq!(check.transactions.len(), 1);
    assert_eq!(check.transactions[0].signature, "sig_1");
}

#[tokio::test]
async fn test_verify_deposit_no_match_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v0/addresses/AddrA/transactions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([transfer_payload(
                "sig_1", "AddrA", 2.5
            )])),
        )
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let check = client
        .verify_deposit(&DepositProbe {
            address: "AddrA".to_string(),
            required_amount: 3_000_000,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap();

    assert!(!check.matched);
    assert_eq!(check.transactions.len(), 1);
}

#[tokio::test]
async fn test_verify_deposit_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let err = client
        .verify_deposit(&DepositProbe {
            address: "AddrA".to_string(),
            required_amount: 3_000_000,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert!(matches!(
        err,
        AppError::Indexer(IndexerError::Status { status: 503, .. })
    ));
}

#[tokio::test]
async fn test_verify_deposit_auth_error_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let err = client
        .verify_deposit(&DepositProbe {
            address: "AddrA".to_string(),
            required_amount: 3_000_000,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap_err();

    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_verify_deposit_malformed_body_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let err = client
        .verify_deposit(&DepositProbe {
            address: "AddrA".to_string(),
            required_amount: 3_000_000,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Indexer(IndexerError::Parse(_))));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_verify_withdrawal_posts_hash_and_matches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v0/transactions"))
        .and(body_json(json!({ "transactions": ["HashH111"] })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([transfer_payload(
                "HashH111", "AddrB", 5.0
            )])),
        )
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let check = client
        .verify_withdrawal(&WithdrawalProbe {
            tx_hash: "HashH111".to_string(),
            to_address: "AddrB".to_string(),
            amount: 5.0,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap();

    assert!(check.matched);
    assert_eq!(check.transaction.unwrap().signature, "HashH111");
}

#[tokio::test]
async fn test_verify_withdrawal_empty_result_is_no_match() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v0/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let check = client
        .verify_withdrawal(&WithdrawalProbe {
            tx_hash: "HashMissing".to_string(),
            to_address: "AddrB".to_string(),
            amount: 5.0,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap();

    assert!(!check.matched);
    assert!(check.transaction.is_none());
}

#[tokio::test]
async fn test_verify_withdrawal_rejects_non_transfer() {
    let server = MockServer::start().await;
    let mut payload = transfer_payload("HashH111", "AddrB", 5.0);
    payload["type"] = json!("SWAP");
    Mock::given(method("POST"))
        .and(path("/v0/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([payload])))
        .mount(&server)
        .await;

    let client = HeliusClient::new(helius_config(&server.uri())).unwrap();
    let check = client
        .verify_withdrawal(&WithdrawalProbe {
            tx_hash: "HashH111".to_string(),
            to_address: "AddrB".to_string(),
            amount: 5.0,
            token: SplToken::Usdc,
            cluster: SolanaCluster::MainnetBeta,
        })
        .await
        .unwrap();

    assert!(!check.matched);
    assert!(check.transaction.is_some());
}

#[tokio::test]
async fn test_exchange_rate_happy_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/assets/solana"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "id": "solana",
                "symbol": "SOL",
                "priceUsd": "151.25",
                "changePercent24Hr": "-1.5"
            },
            "timestamp": 1715700000000i64
        })))
        .mount(&server)
        .await;

    let client = CoinCapClient::new(ExchangeApiConfig {
        base_url: server.uri(),
        api_key: None,
        timeout: Duration::from_secs(5),
        max_retries: 0,
        retry_backoff_base: 1,
    })
    .unwrap();

    let rate = client.get_rate("SOL", "USD").await.unwrap();
    assert_eq!(rate.rate, 151.25);
    assert_eq!(rate.change_24hr, -1.5);
    assert_eq!(rate.crypto_currency, "SOL");
    assert_eq!(rate.fiat_currency, "USD");
}

#[tokio::test]
async fn test_exchange_rate_retries_transient_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/assets/tether"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v3/assets/tether"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "tether", "symbol": "USDT", "priceUsd": "1.0001" },
            "timestamp": 1715700000000i64
        })))
        .mount(&server)
        .await;

    let client = CoinCapClient::new(ExchangeApiConfig {
        base_url: server.uri(),
        api_key: None,
        timeout: Duration::from_secs(5),
        max_retries: 2,
        retry_backoff_base: 1,
    })
    .unwrap();

    let rate = client.get_rate("USDT", "USD").await.unwrap();
    assert_eq!(rate.rate, 1.0001);
    // the optional 24h field defaults when absent
    assert_eq!(rate.change_24hr, 0.0);
}

#[tokio::test]
async fn test_exchange_rate_client_error_does_not_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/assets/solana"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = CoinCapClient::new(ExchangeApiConfig {
        base_url: server.uri(),
        api_key: None,
        timeout: Duration::from_secs(5),
        max_retries: 3,
        retry_backoff_base: 1,
    })
    .unwrap();

    let err = client.get_rate("SOL", "USD").await.unwrap_err();
    assert!(!err.is_transient());
}
