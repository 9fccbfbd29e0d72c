//! The `transport` module is the boundary to the pub/sub broker.
//!
//! The stream manager only talks to the broker through the [`Connector`] and
//! [`Session`] traits. Inbound traffic flows the other way as
//! [`TransportEvent`]s pushed into an [`EventSink`]; every event is tagged
//! with the generation of the session that produced it so the manager can
//! tell a live session's connection loss from a replaced one's.
//!
//! `mqtt` holds the production implementation (MQTT 3.1.1, usually over
//! secure WebSockets).

pub mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::error::Result;

pub use mqtt::MqttConnector;

/// Something the transport observed and the manager has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message {
        generation: u64,
        topic: String,
        payload: Vec<u8>,
    },
    ConnectionLost {
        generation: u64,
        reason: String,
    },
}

impl TransportEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Message { generation, .. } | Self::ConnectionLost { generation, .. } => {
                *generation
            }
        }
    }
}

/// Sending half handed to a session when it is opened.
///
/// The channel behind it is bounded: a slow handler back-pressures the
/// transport's I/O task instead of growing memory without limit.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<TransportEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forwards an inbound message. Returns `false` once the manager is gone.
    pub async fn message(&self, topic: impl Into<String>, payload: Vec<u8>) -> bool {
        self.tx
            .send(TransportEvent::Message {
                generation: self.generation,
                topic: topic.into(),
                payload,
            })
            .await
            .is_ok()
    }

    pub async fn connection_lost(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(TransportEvent::ConnectionLost {
                generation: self.generation,
                reason: reason.into(),
            })
            .await
            .is_ok()
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `url` as `client_id`. Resolves once the broker accepted
    /// the connection; from then on inbound traffic goes to `sink`.
    async fn connect(&self, url: &str, client_id: &str, sink: EventSink)
    -> Result<Box<dyn Session>>;
}

/// One live connection to the broker. Replaced, never repaired.
#[async_trait]
pub trait Session: Send + Sync {
    /// Subscribes all `filters` in one request and waits for the broker's
    /// acknowledgment. Filters are full topics, prefix included.
    async fn subscribe(&self, filters: &[String]) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Best-effort graceful close. Never fails.
    async fn disconnect(&self);
}
