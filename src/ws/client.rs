//! Per-connection reader/writer pumps for the subscriber surface.
//!
//! Each socket runs two tasks: a writer that drains the connection's
//! outbox and pings on an interval, and a reader that terminates on any
//! read error, close frame or idle timeout.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::hub::{CLIENT_OUTBOX_CAPACITY, HubHandle};

/// Ping cadence; under the idle timeout so healthy clients always pong
/// in time.
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Deadline for any single write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection with no traffic (including pongs) for this long is
/// considered dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Drives one upgraded socket until either pump stops, then cleans up
/// its hub registration.
pub async fn run_connection(socket: WebSocket, user_id: String, hub: HubHandle) {
    let (outbox_tx, outbox_rx) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
    let conn_id = hub.register(user_id.clone(), outbox_tx).await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbox_rx));

    read_pump(stream, &user_id).await;

    hub.unregister(user_id, conn_id).await;
    writer.abort();
}

/// Drains the outbox into the socket and emits pings. Exits on the
/// first failed or timed-out write, or when the outbox closes.
async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut outbox: mpsc::Receiver<String>) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first interval tick fires immediately
    ping.tick().await;

    loop {
        let message = tokio::select! {
            outbound = outbox.recv() => match outbound {
                Some(json) => Message::Text(json.into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new().into()),
        };

        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "WebSocket write failed");
                break;
            }
            Err(_) => {
                warn!("WebSocket write deadline exceeded");
                break;
            }
        }
    }
}

/// Consumes inbound frames. Terminates on error, close or an idle gap
/// longer than [`IDLE_TIMEOUT`].
async fn read_pump(mut stream: SplitStream<WebSocket>, user_id: &str) {
    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!(user_id = %user_id, "WebSocket connection closed");
                break;
            }
            Ok(Some(Ok(_))) => {
                // pongs and client chatter only reset the idle clock
            }
            Ok(Some(Err(e))) => {
                debug!(user_id = %user_id, error = %e, "WebSocket read failed");
                break;
            }
            Err(_) => {
                warn!(user_id = %user_id, "WebSocket idle timeout, closing connection");
                break;
            }
        }
    }
}
