use std::time::Duration;

use serde::Deserialize;

use crate::resolver::DEFAULT_DISCOVERY_URL;
use crate::stream::{
    ClientIdPolicy, DEFAULT_PREFIX, ReconnectPolicy, StreamOptions, WILDCARD_ALL,
};

/// Top-level configuration settings for the application.
///
/// Groups the discovery call, the stream manager, its reconnect policy and
/// the relay server.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub discovery: DiscoverySettings,
    pub stream: StreamSettings,
    pub reconnect: ReconnectSettings,
    pub relay: RelaySettings,
    pub log_level: String,
}

/// Where the broker address is looked up.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DiscoverySettings {
    pub url: String,
    pub timeout_secs: u64,
}

/// Subscription behaviour of the stream manager.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StreamSettings {
    pub prefix: String,
    pub topics: Vec<String>,
    pub as_json: bool,
    pub log_payloads: bool,
    pub client_id: ClientIdPolicy,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Address the WebSocket relay binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    /// Request path WebSocket clients connect to.
    pub path: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; whatever is missing comes from
/// [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub discovery: Option<PartialDiscoverySettings>,
    pub stream: Option<PartialStreamSettings>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub relay: Option<PartialRelaySettings>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDiscoverySettings {
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStreamSettings {
    pub prefix: Option<String>,
    pub topics: Option<Vec<String>>,
    pub as_json: Option<bool>,
    pub log_payloads: Option<bool>,
    pub client_id: Option<ClientIdPolicy>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialReconnectSettings {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRelaySettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge_over(self, default: Settings) -> Settings {
        let discovery = self.discovery.unwrap_or_default();
        let stream = self.stream.unwrap_or_default();
        let reconnect = self.reconnect.unwrap_or_default();
        let relay = self.relay.unwrap_or_default();

        Settings {
            discovery: DiscoverySettings {
                url: discovery.url.unwrap_or(default.discovery.url),
                timeout_secs: discovery
                    .timeout_secs
                    .unwrap_or(default.discovery.timeout_secs),
            },
            stream: StreamSettings {
                prefix: stream.prefix.unwrap_or(default.stream.prefix),
                topics: stream.topics.unwrap_or(default.stream.topics),
                as_json: stream.as_json.unwrap_or(default.stream.as_json),
                log_payloads: stream.log_payloads.unwrap_or(default.stream.log_payloads),
                client_id: stream.client_id.unwrap_or(default.stream.client_id),
                keep_alive_secs: stream
                    .keep_alive_secs
                    .unwrap_or(default.stream.keep_alive_secs),
                connect_timeout_secs: stream
                    .connect_timeout_secs
                    .unwrap_or(default.stream.connect_timeout_secs),
                ack_timeout_secs: stream
                    .ack_timeout_secs
                    .unwrap_or(default.stream.ack_timeout_secs),
                channel_capacity: stream
                    .channel_capacity
                    .unwrap_or(default.stream.channel_capacity),
            },
            reconnect: ReconnectSettings {
                max_attempts: reconnect
                    .max_attempts
                    .unwrap_or(default.reconnect.max_attempts),
                initial_backoff_ms: reconnect
                    .initial_backoff_ms
                    .unwrap_or(default.reconnect.initial_backoff_ms),
                max_backoff_ms: reconnect
                    .max_backoff_ms
                    .unwrap_or(default.reconnect.max_backoff_ms),
            },
            relay: RelaySettings {
                host: relay.host.unwrap_or(default.relay.host),
                port: relay.port.unwrap_or(default.relay.port),
                path: relay.path.unwrap_or(default.relay.path),
            },
            log_level: self.log_level.unwrap_or(default.log_level),
        }
    }
}

impl Settings {
    /// Options for a [`StreamManager`](crate::stream::StreamManager) built
    /// from these settings. Callbacks are left unset.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::default()
            .with_topics(self.stream.topics.iter().cloned())
            .with_prefix(self.stream.prefix.clone())
            .with_as_json(self.stream.as_json)
            .with_log_payloads(self.stream.log_payloads)
            .with_client_id_policy(self.stream.client_id)
            .with_reconnect_policy(ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            })
            .with_discovery_url(self.discovery.url.clone())
            .with_discovery_timeout(Duration::from_secs(self.discovery.timeout_secs))
            .with_keep_alive(Duration::from_secs(self.stream.keep_alive_secs))
            .with_connect_timeout(Duration::from_secs(self.stream.connect_timeout_secs))
            .with_ack_timeout(Duration::from_secs(self.stream.ack_timeout_secs))
            .with_channel_capacity(self.stream.channel_capacity)
    }

    /// `host:port` the relay listens on.
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }
}

/// Provides default values for `Settings`.
///
/// Matches the public SondeHub feed: everything under `sondes/`, discovered
/// through the SondeHub API.
impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery: DiscoverySettings {
                url: DEFAULT_DISCOVERY_URL.to_string(),
                timeout_secs: 10,
            },
            stream: StreamSettings {
                prefix: DEFAULT_PREFIX.to_string(),
                topics: vec![WILDCARD_ALL.to_string()],
                as_json: false,
                log_payloads: false,
                client_id: ClientIdPolicy::Fresh,
                keep_alive_secs: 30,
                connect_timeout_secs: 15,
                ack_timeout_secs: 10,
                channel_capacity: 1024,
            },
            reconnect: ReconnectSettings {
                max_attempts: 5,
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
            },
            relay: RelaySettings {
                host: "127.0.0.1".to_string(),
                port: 8070,
                path: "/ws".to_string(),
            },
            log_level: "info".to_string(),
        }
    }
}
