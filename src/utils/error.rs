//! Error types for the stream client.
//!
//! Every fallible operation in the crate returns [`StreamError`]. The first
//! four variants are the failure classes of the subscription lifecycle; the
//! remaining ones wrap the ambient collaborators (configuration, I/O).

use thiserror::Error;

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while resolving, connecting or subscribing
#[derive(Error, Debug)]
pub enum StreamError {
    /// The discovery call failed or returned an unusable address
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// The transport handshake failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// A subscribe or unsubscribe acknowledgment carried an error
    #[error("Subscription error on '{filter}': {reason}")]
    Subscription { filter: String, reason: String },

    /// The reconnect cycle ran out of attempts; the stream is idle until
    /// the next topic change
    #[error("Gave up reconnecting after {attempts} attempts: {reason}")]
    ReconnectExhausted { attempts: u32, reason: String },

    /// Operation attempted on a stopped manager
    #[error("Stream manager is stopped")]
    Disconnected,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Create a resolution error
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create a connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a subscription error for `filter`
    pub fn subscription(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Subscription {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the manager has been stopped.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::Resolution(err.to_string())
    }
}
