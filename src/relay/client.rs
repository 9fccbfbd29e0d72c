use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

/// A browser connected to the relay.
///
/// Frames pushed on `sender` are written to the socket by the connection's
/// writer task.
#[derive(Debug)]
pub struct RelayClient {
    pub id: String,
    pub sender: UnboundedSender<WsMessage>,
}

impl RelayClient {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            sender,
        }
    }

    /// Queues a frame. Returns `false` once the writer has gone away.
    pub fn send(&self, frame: WsMessage) -> bool {
        self.sender.send(frame).is_ok()
    }
}
