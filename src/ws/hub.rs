//! The subscriber hub: a single task owning the client registry.
//!
//! All registry mutation happens on the hub task, so no lock is needed
//! and per-user message order matches settlement commit order. Producers
//! reach the hub only through bounded channels with non-blocking offers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{Balance, DepositSession, UpdateBroadcaster, Withdrawal};

/// Capacity of the hub's register/unregister/broadcast channels.
const HUB_CHANNEL_CAPACITY: usize = 100;

/// Capacity of each connection's outbox.
pub const CLIENT_OUTBOX_CAPACITY: usize = 256;

/// Identifies one connection within a user's set.
pub type ConnId = u64;

/// The envelope pushed to subscribers. Exactly one payload is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit: Option<DepositSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal: Option<Withdrawal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
}

impl WsMessage {
    pub fn deposit(session: DepositSession) -> Self {
        Self {
            kind: "deposit".to_string(),
            deposit: Some(session),
            withdrawal: None,
            balance: None,
        }
    }

    pub fn withdrawal(withdrawal: Withdrawal) -> Self {
        Self {
            kind: "withdrawal".to_string(),
            deposit: None,
            withdrawal: Some(withdrawal),
            balance: None,
        }
    }

    pub fn balance(balance: Balance) -> Self {
        Self {
            kind: "balance".to_string(),
            deposit: None,
            withdrawal: None,
            balance: Some(balance),
        }
    }

    /// The user this message belongs to. An empty id on a balance
    /// message means "every connected user".
    fn user_id(&self) -> &str {
        if let Some(deposit) = &self.deposit {
            &deposit.user_id
        } else if let Some(withdrawal) = &self.withdrawal {
            &withdrawal.user_id
        } else if let Some(balance) = &self.balance {
            &balance.user_id
        } else {
            ""
        }
    }
}

struct Registration {
    user_id: String,
    conn_id: ConnId,
    outbox: mpsc::Sender<String>,
}

/// The hub task state. Constructed together with its [`HubHandle`];
/// consumed by [`WsHub::run`].
pub struct WsHub {
    clients: HashMap<String, HashMap<ConnId, mpsc::Sender<String>>>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<(String, ConnId)>,
    broadcast_rx: mpsc::Receiver<WsMessage>,
}

/// Cloneable producer side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<(String, ConnId)>,
    broadcast_tx: mpsc::Sender<WsMessage>,
    next_conn_id: Arc<AtomicU64>,
}

impl WsHub {
    #[must_use]
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);

        let hub = Self {
            clients: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Spawns the hub event loop.
    pub fn spawn() -> (JoinHandle<()>, HubHandle) {
        let (hub, handle) = Self::new();
        (tokio::spawn(hub.run()), handle)
    }

    /// Serializes registration, unregistration and broadcast. Exits once
    /// the broadcast channel closes and is drained.
    ///
    /// Polling is biased so lifecycle events queued before a broadcast
    /// are applied before it is dispatched.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(registration) = self.register_rx.recv() => {
                    self.register(registration);
                }
                Some((user_id, conn_id)) = self.unregister_rx.recv() => {
                    self.unregister(&user_id, conn_id);
                }
                message = self.broadcast_rx.recv() => {
                    match message {
                        Some(message) => self.dispatch(message),
                        None => break,
                    }
                }
            }
        }
        info!("WebSocket hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        let connections = self.clients.entry(registration.user_id.clone()).or_default();
        connections.insert(registration.conn_id, registration.outbox);
        info!(
            user_id = %registration.user_id,
            connection_count = connections.len(),
            "WebSocket client registered"
        );
    }

    fn unregister(&mut self, user_id: &str, conn_id: ConnId) {
        if let Some(connections) = self.clients.get_mut(user_id) {
            if connections.remove(&conn_id).is_some() {
                info!(
                    user_id = %user_id,
                    connection_count = connections.len(),
                    "WebSocket client unregistered"
                );
            }
            if connections.is_empty() {
                self.clients.remove(user_id);
            }
        }
    }

    fn dispatch(&mut self, message: WsMessage) {
        let user_id = message.user_id().to_string();

        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode WebSocket message");
                return;
            }
        };

        if !user_id.is_empty() {
            if self.clients.contains_key(&user_id) {
                self.send_to_user(&user_id, &json, &message.kind);
            } else {
                debug!(user_id = %user_id, kind = %message.kind, "No clients found for broadcast");
            }
        } else if message.kind == "balance" {
            // Administrative fan-out to every connected user
            let users: Vec<String> = self.clients.keys().cloned().collect();
            for user in users {
                self.send_to_user(&user, &json, &message.kind);
            }
        } else {
            warn!(kind = %message.kind, "Broadcast message without a user id dropped");
        }
    }

    /// Offers a message to every connection of a user. A full outbox
    /// drops the message for that client; a closed outbox removes it.
    fn send_to_user(&mut self, user_id: &str, json: &str, kind: &str) {
        let Some(connections) = self.clients.get_mut(user_id) else {
            return;
        };

        let mut dead = Vec::new();
        for (conn_id, outbox) in connections.iter() {
            match outbox.try_send(json.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        user_id = %user_id,
                        conn_id,
                        kind = %kind,
                        "Client outbox full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*conn_id);
                }
            }
        }

        for conn_id in dead {
            connections.remove(&conn_id);
            info!(user_id = %user_id, conn_id, "Removed closed WebSocket connection");
        }
        if connections.is_empty() {
            self.clients.remove(user_id);
        }
    }
}

impl HubHandle {
    /// Registers a connection's outbox under a user, returning the
    /// connection id for later unregistration.
    pub async fn register(&self, user_id: String, outbox: mpsc::Sender<String>) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if self
            .register_tx
            .send(Registration {
                user_id,
                conn_id,
                outbox,
            })
            .await
            .is_err()
        {
            warn!("WebSocket hub is gone, registration dropped");
        }
        conn_id
    }

    pub async fn unregister(&self, user_id: String, conn_id: ConnId) {
        if self.unregister_tx.send((user_id, conn_id)).await.is_err() {
            warn!("WebSocket hub is gone, unregistration dropped");
        }
    }

    fn offer(&self, message: WsMessage) {
        if let Err(e) = self.broadcast_tx.try_send(message) {
            warn!(error = %e, "WebSocket hub saturated, dropping broadcast");
        }
    }
}

impl UpdateBroadcaster for HubHandle {
    fn broadcast_deposit_session(&self, session: &DepositSession) {
        debug!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            "Broadcasting deposit session update"
        );
        self.offer(WsMessage::deposit(session.clone()));
    }

    fn broadcast_withdrawal(&self, withdrawal: &Withdrawal) {
        debug!(
            withdrawal_id = %withdrawal.withdrawal_id,
            user_id = %withdrawal.user_id,
            "Broadcasting withdrawal update"
        );
        self.offer(WsMessage::withdrawal(withdrawal.clone()));
    }

    fn broadcast_balance(&self, balance: &Balance) {
        debug!(
            user_id = %balance.user_id,
            currency_code = %balance.currency_code,
            "Broadcasting balance update"
        );
        self.offer(WsMessage::balance(balance.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionStatus;
    use chrono::Utc;

    fn session_for(user_id: &str) -> DepositSession {
        let now = Utc::now();
        DepositSession {
            id: "1".to_string(),
            session_id: "sess_1".to_string(),
            user_id: user_id.to_string(),
            chain_id: "sol-mainnet".to_string(),
            network: "solana".to_string(),
            wallet_address: "Addr1".to_string(),
            amount: 1.0,
            crypto_currency: "SOL".to_string(),
            status: SessionStatus::Pending,
            metadata: serde_json::Value::Null,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn balance_for(user_id: &str) -> Balance {
        Balance {
            id: "b1".to_string(),
            user_id: user_id.to_string(),
            currency_code: "USD".to_string(),
            amount_cents: 100,
            amount_units: "1.0".to_string(),
            reserved_cents: 0,
            reserved_units: "0".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_user() {
        let (_hub_task, handle) = WsHub::spawn();
        let (outbox_tx, mut outbox_rx) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
        handle.register("user_1".to_string(), outbox_tx).await;

        handle.broadcast_deposit_session(&session_for("user_1"));

        let json = tokio::time::timeout(std::time::Duration::from_secs(1), outbox_rx.recv())
            .await
            .expect("timed out")
            .expect("outbox closed");
        let message: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message.kind, "deposit");
        assert_eq!(message.deposit.unwrap().user_id, "user_1");
    }

    #[tokio::test]
    async fn test_broadcast_skips_other_users() {
        let (_hub_task, handle) = WsHub::spawn();
        let (outbox_tx, mut outbox_rx) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
        handle.register("user_2".to_string(), outbox_tx).await;

        handle.broadcast_deposit_session(&session_for("user_1"));
        // a later message for user_2 must be the first thing delivered
        handle.broadcast_balance(&balance_for("user_2"));

        let json = tokio::time::timeout(std::time::Duration::from_secs(1), outbox_rx.recv())
            .await
            .expect("timed out")
            .expect("outbox closed");
        let message: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message.kind, "balance");
    }

    #[tokio::test]
    async fn test_empty_user_balance_fans_out_to_everyone() {
        let (_hub_task, handle) = WsHub::spawn();
        let (tx_a, mut rx_a) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
        let (tx_b, mut rx_b) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
        handle.register("user_a".to_string(), tx_a).await;
        handle.register("user_b".to_string(), tx_b).await;

        handle.broadcast_balance(&balance_for(""));

        for rx in [&mut rx_a, &mut rx_b] {
            let json = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("outbox closed");
            let message: WsMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(message.kind, "balance");
        }
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let (_hub_task, handle) = WsHub::spawn();
        let (outbox_tx, mut outbox_rx) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
        let conn_id = handle.register("user_1".to_string(), outbox_tx).await;
        handle.unregister("user_1".to_string(), conn_id).await;

        handle.broadcast_deposit_session(&session_for("user_1"));

        // the outbox sender was dropped by the hub on unregister
        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(200), outbox_rx.recv()).await;
        assert!(matches!(outcome, Ok(None)));
    }

    #[test]
    fn test_message_envelope_shape() {
        let message = WsMessage::balance(balance_for("user_1"));
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"balance""#));
        assert!(!json.contains("deposit"));
        assert!(!json.contains("withdrawal"));
    }
}
