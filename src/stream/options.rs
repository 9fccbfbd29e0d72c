//! Caller-facing configuration of a [`StreamManager`](super::StreamManager).
//!
//! Every field has a default, so `StreamOptions::default()` subscribes to
//! everything under the `sondes` prefix. The `with_*` setters consume and
//! return the options so they chain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::resolver::DEFAULT_DISCOVERY_URL;
use crate::stream::message::Message;

/// Topic prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "sondes";

/// Filter matching every topic under the prefix.
pub const WILDCARD_ALL: &str = "#";

/// Receives every inbound message, in delivery order.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Called with the client identifier after each successful (re)connect.
pub type ConnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called with the reason whenever the transport reports a lost connection.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// How the MQTT client identifier is chosen on each connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientIdPolicy {
    /// A new UUID for every connection.
    #[default]
    Fresh,
    /// Generate once, then present the same identifier on every reconnect.
    Reuse,
}

/// Bounded exponential backoff applied by the reconnect cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct StreamOptions {
    /// Initial topic filters, without the prefix.
    pub topics: Vec<String>,
    pub prefix: String,
    /// Pre-decode payloads as JSON into `Message::json`.
    pub as_json: bool,
    /// Log every raw payload at debug level under `sondestream::payload`.
    pub log_payloads: bool,
    pub client_id: ClientIdPolicy,
    pub reconnect: ReconnectPolicy,
    pub discovery_url: String,
    pub discovery_timeout: Duration,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a SUBACK/UNSUBACK.
    pub ack_timeout: Duration,
    /// Capacity of the transport-to-dispatcher channel.
    pub channel_capacity: usize,
    pub on_connect: Option<ConnectCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
}

impl StreamOptions {
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_as_json(mut self, as_json: bool) -> Self {
        self.as_json = as_json;
        self
    }

    pub fn with_log_payloads(mut self, log_payloads: bool) -> Self {
        self.log_payloads = log_payloads;
        self
    }

    pub fn with_client_id_policy(mut self, policy: ClientIdPolicy) -> Self {
        self.client_id = policy;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = url.into();
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_on_connect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn with_on_disconnect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            topics: vec![WILDCARD_ALL.to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            as_json: false,
            log_payloads: false,
            client_id: ClientIdPolicy::Fresh,
            reconnect: ReconnectPolicy::default(),
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            discovery_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(10),
            channel_capacity: 1024,
            on_connect: None,
            on_disconnect: None,
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("topics", &self.topics)
            .field("prefix", &self.prefix)
            .field("as_json", &self.as_json)
            .field("log_payloads", &self.log_payloads)
            .field("client_id", &self.client_id)
            .field("reconnect", &self.reconnect)
            .field("discovery_url", &self.discovery_url)
            .field("ack_timeout", &self.ack_timeout)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish_non_exhaustive()
    }
}
