//! The WebSocket subscriber surface: hub and per-connection pumps.

pub mod client;
pub mod hub;

pub use client::run_connection;
pub use hub::{ConnId, HubHandle, WsHub, WsMessage};
