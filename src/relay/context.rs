//! Shared state of the relay: the connected clients and the one stream
//! manager feeding them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::relay::client::RelayClient;
use crate::resolver::{HttpResolver, Resolve};
use crate::stream::{Message, StreamManager, StreamOptions};
use crate::transport::{Connector, MqttConnector};
use crate::utils::error::{Result, StreamError};

/// Client registry plus the lazily started stream.
///
/// The stream is started when the first client registers and stopped when
/// the last one leaves. Registration and removal are serialized on the
/// stream lock, so start and stop never overlap. A stream whose reconnect
/// cycle gives up is reported through [`failure`](RelayContext::failure).
pub struct RelayContext {
    options: StreamOptions,
    resolver: Arc<dyn Resolve>,
    connector: Arc<dyn Connector>,
    clients: StdMutex<HashMap<String, RelayClient>>,
    stream: Mutex<Option<StreamManager>>,
    failed: CancellationToken,
    failure: StdMutex<Option<StreamError>>,
}

impl RelayContext {
    /// Context streaming from SondeHub with the given options.
    pub fn new(options: StreamOptions) -> Result<Arc<Self>> {
        let resolver = HttpResolver::new(options.discovery_url.clone(), options.discovery_timeout)?;
        let connector = MqttConnector::new(options.keep_alive);
        Ok(Self::with_transport(
            options,
            Arc::new(resolver),
            Arc::new(connector),
        ))
    }

    pub fn with_transport(
        options: StreamOptions,
        resolver: Arc<dyn Resolve>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            resolver,
            connector,
            clients: StdMutex::new(HashMap::new()),
            stream: Mutex::new(None),
            failed: CancellationToken::new(),
            failure: StdMutex::new(None),
        })
    }

    /// Adds `client`, starting the stream if it is the first one.
    ///
    /// When the stream cannot be started the client is dropped again and
    /// the error returned.
    pub async fn register(self: &Arc<Self>, client: RelayClient) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let id = client.id.clone();
        self.clients().insert(id.clone(), client);
        info!(client_id = %id, "client registered");

        if stream.is_some() {
            return Ok(());
        }

        let relay = Arc::downgrade(self);
        match StreamManager::start_with(
            self.options.clone(),
            move |message| forward(&relay, &message),
            self.resolver.clone(),
            self.connector.clone(),
        )
        .await
        {
            Ok(manager) => {
                info!("first client connected, stream started");
                self.watch(manager.clone());
                *stream = Some(manager);
                Ok(())
            }
            Err(e) => {
                self.clients().remove(&id);
                Err(e)
            }
        }
    }

    /// Removes a client, stopping the stream once nobody is left.
    ///
    /// Unknown ids are fine: a client may already have been pruned by
    /// [`broadcast`](Self::broadcast).
    pub async fn unregister(&self, client_id: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let remaining = {
            let mut clients = self.clients();
            if clients.remove(client_id).is_some() {
                info!(%client_id, "client unregistered");
            }
            clients.len()
        };

        if remaining == 0 {
            if let Some(manager) = stream.take() {
                info!("last client left, stopping stream");
                manager.stop().await?;
            }
        }
        Ok(())
    }

    /// Sends `frame` to every client and drops the ones whose connection is
    /// gone. Returns how many clients got the frame.
    pub fn broadcast(&self, frame: WsMessage) -> usize {
        let mut clients = self.clients();
        clients.retain(|id, client| {
            let alive = client.send(frame.clone());
            if !alive {
                warn!(client_id = %id, "dropping unreachable client");
            }
            alive
        });
        clients.len()
    }

    /// Resolves with the error of a stream that gave up reconnecting.
    pub async fn failure(&self) -> StreamError {
        self.failed.cancelled().await;
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or(StreamError::Disconnected)
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    pub async fn is_streaming(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Disconnects every client and stops the stream.
    pub async fn shutdown(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let dropped = {
            let mut clients = self.clients();
            let n = clients.len();
            clients.clear();
            n
        };
        debug!(clients = dropped, "relay shutting down");

        match stream.take() {
            Some(manager) => manager.stop().await,
            None => Ok(()),
        }
    }

    fn watch(self: &Arc<Self>, manager: StreamManager) {
        let relay = Arc::downgrade(self);
        tokio::spawn(async move {
            // Ok means the stream was stopped on purpose
            if let Err(e) = manager.closed().await {
                error!(error = %e, "relay stream gave up");
                if let Some(relay) = relay.upgrade() {
                    *relay.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
                    relay.failed.cancel();
                }
            }
        });
    }

    fn clients(&self) -> StdMutexGuard<'_, HashMap<String, RelayClient>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn forward(relay: &Weak<RelayContext>, message: &Message) {
    let Some(relay) = relay.upgrade() else {
        return;
    };
    // text frames for UTF-8 payloads, the raw bytes otherwise
    let frame = match message.payload_str() {
        Some(text) => WsMessage::text(text.to_owned()),
        None => WsMessage::binary(message.payload.clone()),
    };
    let delivered = relay.broadcast(frame);
    debug!(topic = %message.topic, delivered, "relayed message");
}
