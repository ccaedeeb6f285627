//! Ledger invariants: idempotent settlement, duplicate-hash protection,
//! terminal monotonicity and the balance-log sum property.

use std::sync::Arc;

use chrono::Utc;

use transaction_verifier::app::SettlementEngine;
use transaction_verifier::domain::{
    AppError, Balance, DepositSession, IndexedTransaction, LedgerStore, SessionStatus, SplToken,
    TokenTransfer, Withdrawal, WithdrawalStatus,
};
use transaction_verifier::test_utils::{MockLedgerStore, RecordingBroadcaster};

const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

fn engine(
    store: &Arc<MockLedgerStore>,
    broadcaster: &Arc<RecordingBroadcaster>,
) -> SettlementEngine {
    SettlementEngine::new(
        Arc::clone(store) as Arc<dyn LedgerStore>,
        Arc::clone(broadcaster) as _,
    )
}

fn session(session_id: &str, user_id: &str, address: &str, amount: f64) -> DepositSession {
    let now = Utc::now();
    DepositSession {
        id: format!("row_{session_id}"),
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        chain_id: "sol-mainnet".to_string(),
        network: "solana".to_string(),
        wallet_address: address.to_string(),
        amount,
        crypto_currency: "USDC".to_string(),
        status: SessionStatus::Pending,
        metadata: serde_json::json!({}),
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

fn withdrawal(withdrawal_id: &str, user_id: &str, usd_cents: i64, reserved: i64) -> Withdrawal {
    let now = Utc::now();
    Withdrawal {
        id: format!("row_{withdrawal_id}"),
        withdrawal_id: withdrawal_id.to_string(),
        user_id: user_id.to_string(),
        chain_id: "sol-mainnet".to_string(),
        network: "solana".to_string(),
        crypto_currency: "USDC".to_string(),
        usd_amount_cents: usd_cents,
        crypto_amount: format!("{:.1}", usd_cents as f64 / 100.0),
        exchange_rate: "1.0".to_string(),
        fee_cents: 0,
        to_address: "AddrTo111".to_string(),
        source_wallet_address: "Treasury111".to_string(),
        tx_hash: Some("HashW111".to_string()),
        amount_reserved_cents: reserved,
        reservation_released: false,
        reservation_released_at: None,
        status: WithdrawalStatus::Pending,
        metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

fn balance(user_id: &str, amount_cents: i64, reserved_cents: i64) -> Balance {
    Balance {
        id: format!("bal_{user_id}"),
        user_id: user_id.to_string(),
        currency_code: "USD".to_string(),
        amount_cents,
        amount_units: format!("{:.2}", amount_cents as f64 / 100.0),
        reserved_cents,
        reserved_units: format!("{:.2}", reserved_cents as f64 / 100.0),
        updated_at: Utc::now(),
    }
}

fn transfer(signature: &str, to: &str, amount: f64) -> IndexedTransaction {
    IndexedTransaction {
        tx_type: "TRANSFER".to_string(),
        signature: signature.to_string(),
        fee: 5000,
        slot: 1,
        timestamp: 1715700000,
        token_transfers: vec![TokenTransfer {
            from_user_account: "Sender111".to_string(),
            to_user_account: to.to_string(),
            token_amount: amount,
            mint: USDC_MINT.to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_double_settlement_is_a_noop() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let sess = session("sess_a", "user_a", "AddrA", 3.0);
    store.insert_session(sess.clone());
    store.insert_balance(balance("user_a", 0, 0));

    let engine = engine(&store, &broadcaster);
    let batch = vec![transfer("sig_a", "AddrA", 3.0)];

    engine
        .settle_verified_deposit(&sess, &batch, SplToken::Usdc, 3.0, Some(USDC_MINT), 6, 1.0)
        .await
        .unwrap();
    // second pickup of the same session settles nothing
    engine
        .settle_verified_deposit(&sess, &batch, SplToken::Usdc, 3.0, Some(USDC_MINT), 6, 1.0)
        .await
        .unwrap();

    assert_eq!(store.transactions().len(), 1);
    assert_eq!(
        store.get_balance("user_a", "USD").await.unwrap().amount_cents,
        300
    );
    assert_eq!(store.balance_logs().len(), 1);
    // only the first settlement broadcast anything
    assert_eq!(broadcaster.messages().len(), 2);
}

#[tokio::test]
async fn test_same_hash_cannot_back_two_deposits() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let first = session("sess_b1", "user_b", "AddrB", 3.0);
    let second = session("sess_b2", "user_b", "AddrB", 3.0);
    store.insert_session(first.clone());
    store.insert_session(second.clone());
    store.insert_balance(balance("user_b", 0, 0));

    let engine = engine(&store, &broadcaster);
    let batch = vec![transfer("sig_shared", "AddrB", 3.0)];

    engine
        .settle_verified_deposit(&first, &batch, SplToken::Usdc, 3.0, Some(USDC_MINT), 6, 1.0)
        .await
        .unwrap();
    engine
        .settle_verified_deposit(&second, &batch, SplToken::Usdc, 3.0, Some(USDC_MINT), 6, 1.0)
        .await
        .unwrap();

    // the unique (chain, hash, type) guard stops the second credit
    assert_eq!(store.transactions().len(), 1);
    assert_eq!(
        store.get_balance("user_b", "USD").await.unwrap().amount_cents,
        300
    );
    assert_eq!(
        store.session("sess_b2").unwrap().status,
        SessionStatus::Pending
    );
}

#[tokio::test]
async fn test_insufficient_balance_aborts_withdrawal() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let wd = withdrawal("wd_poor", "user_c", 500, 0);
    store.insert_withdrawal(wd.clone());
    store.insert_balance(balance("user_c", 300, 0));

    let engine = engine(&store, &broadcaster);
    let result = engine
        .settle_verified_withdrawal(&wd, &transfer("HashW111", "AddrTo111", 5.0))
        .await;

    assert!(matches!(result, Err(AppError::Invariant(_))));
    assert!(store.transactions().is_empty());
    assert_eq!(
        store.get_balance("user_c", "USD").await.unwrap().amount_cents,
        300
    );
    assert_eq!(
        store.withdrawal("wd_poor").unwrap().status,
        WithdrawalStatus::Pending
    );
    assert!(broadcaster.messages().is_empty());
}

#[tokio::test]
async fn test_terminal_withdrawal_is_never_rewritten() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let mut wd = withdrawal("wd_done", "user_d", 500, 500);
    wd.status = WithdrawalStatus::Completed;
    wd.reservation_released = true;
    store.insert_withdrawal(wd.clone());
    store.insert_balance(balance("user_d", 1000, 0));

    let engine = engine(&store, &broadcaster);
    engine.fail_withdrawal(&wd, "late failure").await.unwrap();

    assert_eq!(
        store.withdrawal("wd_done").unwrap().status,
        WithdrawalStatus::Completed
    );
    assert_eq!(
        store.get_balance("user_d", "USD").await.unwrap().reserved_cents,
        0
    );
    assert!(broadcaster.messages().is_empty());
}

#[tokio::test]
async fn test_failed_withdrawal_release_happens_once() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let wd = withdrawal("wd_fail", "user_e", 500, 500);
    store.insert_withdrawal(wd.clone());
    store.insert_balance(balance("user_e", 1000, 500));

    let engine = engine(&store, &broadcaster);
    engine.fail_withdrawal(&wd, "no hash").await.unwrap();
    engine.fail_withdrawal(&wd, "no hash").await.unwrap();

    let bal = store.get_balance("user_e", "USD").await.unwrap();
    assert_eq!(bal.amount_cents, 1000);
    assert_eq!(bal.reserved_cents, 0);
    assert_eq!(store.balance_logs().len(), 1);
    assert_eq!(broadcaster.messages().len(), 1);
}

#[tokio::test]
async fn test_balance_log_sum_tracks_amount_cents() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    store.insert_balance(balance("user_f", 0, 0));

    let engine = engine(&store, &broadcaster);

    let deposits = [("sess_f1", "sig_f1", 3.0), ("sess_f2", "sig_f2", 1.25)];
    for (sid, sig, amount) in deposits {
        let sess = session(sid, "user_f", "AddrF", amount);
        store.insert_session(sess.clone());
        let batch = vec![transfer(sig, "AddrF", amount)];
        engine
            .settle_verified_deposit(
                &sess,
                &batch,
                SplToken::Usdc,
                amount,
                Some(USDC_MINT),
                6,
                1.0,
            )
            .await
            .unwrap();
    }

    let wd = withdrawal("wd_f", "user_f", 100, 0);
    store.insert_withdrawal(wd.clone());
    engine
        .settle_verified_withdrawal(&wd, &transfer("HashF111", "AddrTo111", 1.0))
        .await
        .unwrap();

    let bal = store.get_balance("user_f", "USD").await.unwrap();
    let log_sum: i64 = store.balance_logs().iter().map(|l| l.change_cents).sum();
    assert_eq!(bal.amount_cents, 300 + 125 - 100);
    assert_eq!(log_sum, bal.amount_cents);
    // each settled deposit left exactly one transaction row
    assert_eq!(store.transactions().len(), 3);
}

#[tokio::test]
async fn test_completed_session_has_exactly_one_transaction() {
    let store = Arc::new(MockLedgerStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let sess = session("sess_g", "user_g", "AddrG", 3.0);
    store.insert_session(sess.clone());
    store.insert_balance(balance("user_g", 0, 0));

    let engine = engine(&store, &broadcaster);
    let batch = vec![transfer("sig_g", "AddrG", 3.0)];
    engine
        .settle_verified_deposit(&sess, &batch, SplToken::Usdc, 3.0, Some(USDC_MINT), 6, 1.0)
        .await
        .unwrap();

    let completed = store.session("sess_g").unwrap();
    assert_eq!(completed.status, SessionStatus::Completed);
    let rows: Vec<_> = store
        .transactions()
        .into_iter()
        .filter(|t| t.deposit_session_id.as_deref() == Some("sess_g"))
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status.as_str(), "verified");
}
