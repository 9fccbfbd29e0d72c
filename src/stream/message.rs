use chrono::{DateTime, Utc};
use serde_json::Value;

/// A message received from the broker.
///
/// `payload` is always the raw bytes exactly as the transport delivered
/// them. `json` is only filled when the manager runs with `as_json` and the
/// payload parsed; a payload that fails to parse is still delivered, with
/// `json` left empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Full broker topic, prefix included.
    pub topic: String,
    pub payload: Vec<u8>,
    /// Local time the dispatcher picked the message up.
    pub received_at: DateTime<Utc>,
    pub json: Option<Value>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
            json: None,
        }
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
