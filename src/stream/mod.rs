//! The `stream` module is the subscription lifecycle manager.
//!
//! [`StreamManager`] keeps a broker subscription alive: it resolves the
//! broker address, connects, subscribes the current topic set, re-does all
//! of that when the connection drops, and hands every inbound [`Message`] to
//! the caller's handler.

pub mod manager;
pub mod message;
pub mod options;
pub mod topics;

pub use manager::{ConnectionState, StreamManager};
pub use message::Message;
pub use options::{
    ClientIdPolicy, ConnectCallback, DEFAULT_PREFIX, DisconnectCallback, MessageHandler,
    ReconnectPolicy, StreamOptions, WILDCARD_ALL,
};
pub use topics::TopicSet;

#[cfg(test)]
mod tests;
