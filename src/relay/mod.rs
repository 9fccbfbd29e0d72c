//! The `relay` module re-publishes the SondeHub feed to browsers over a plain
//! WebSocket.
//!
//! One [`StreamManager`](crate::stream::StreamManager) serves every client.
//! It is started when the first browser connects and stopped when the last
//! one disconnects. Each payload is forwarded unchanged: UTF-8 payloads as
//! text frames, anything else as binary frames.

pub mod client;
pub mod context;
pub mod server;

pub use client::RelayClient;
pub use context::RelayContext;
pub use server::{serve, start_relay_server};
