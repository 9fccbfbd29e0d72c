//! Stream manager
//!
//! Owns the authoritative topic set and the broker session, and keeps the two
//! consistent across reconnects.
//!
//! Concurrency notes:
//! - Topic changes, reconnects and `stop` all go through one async mutex that
//!   stays held across the broker round-trip. Subscription churn is rare, so
//!   serializing it is simpler than reconciling interleaved requests.
//! - Inbound messages never touch that mutex. The transport pushes them onto
//!   a bounded channel drained by a single dispatch task, which calls the
//!   handler in delivery order.
//! - A connection loss is handed from the dispatch task to a supervisor task
//!   that takes the mutex and runs the reconnect cycle, so a slow reconnect
//!   cannot stall message delivery.
//! - Each session gets a generation number. Losses reported by a session
//!   that has already been replaced are ignored. Messages are not fenced:
//!   publishes a replaced session queued before the swap are still handed
//!   to the handler, once each.
//! - When a reconnect cycle runs out of attempts the state becomes
//!   `Failed` and [`StreamManager::closed`] resolves with the error. The
//!   next topic change tries again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::resolver::{HttpResolver, Resolve};
use crate::stream::message::Message;
use crate::stream::options::{ClientIdPolicy, MessageHandler, StreamOptions};
use crate::stream::topics::{TopicSet, full_topic};
use crate::transport::{Connector, EventSink, MqttConnector, Session, TransportEvent};
use crate::utils::error::{Result, StreamError};

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, with every filter of the topic set acknowledged.
    Subscribed,
    /// The last reconnect cycle gave up.
    Failed,
}

struct State {
    topics: TopicSet,
    session: Option<Box<dyn Session>>,
    client_id: Option<String>,
    generation: u64,
}

struct Inner {
    options: StreamOptions,
    resolver: Arc<dyn Resolve>,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    /// Mirror of `State::generation` readable without the lock.
    generation: AtomicU64,
    status: watch::Sender<ConnectionState>,
    /// Attempts and last error of the cycle that gave up.
    failure: StdMutex<Option<(u32, String)>>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

/// Handle to a running subscription.
///
/// Cloning is cheap; all clones drive the same session. Call [`stop`] when
/// done, the background tasks keep running until then.
///
/// [`stop`]: StreamManager::stop
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl StreamManager {
    /// Resolves the broker through the configured discovery URL, connects
    /// over MQTT and subscribes the initial topics.
    pub async fn start<F>(options: StreamOptions, handler: F) -> Result<Self>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let resolver = HttpResolver::new(options.discovery_url.clone(), options.discovery_timeout)?;
        let connector = MqttConnector::new(options.keep_alive);
        Self::start_with(options, handler, Arc::new(resolver), Arc::new(connector)).await
    }

    /// Same as [`start`](Self::start) with an explicit resolver and transport.
    ///
    /// The initial connect is attempted once. Any failure is returned and
    /// nothing keeps running in the background.
    pub async fn start_with<F>(
        options: StreamOptions,
        handler: F,
        resolver: Arc<dyn Resolve>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                topics: TopicSet::from_filters(options.topics.iter().cloned()),
                session: None,
                client_id: None,
                generation: 0,
            }),
            options,
            resolver,
            connector,
            generation: AtomicU64::new(0),
            status,
            failure: StdMutex::new(None),
            events: events_tx,
            cancel: CancellationToken::new(),
        });

        {
            let mut state = inner.state.lock().await;
            if let Err(e) = inner.connect_locked(&mut state).await {
                error!(error = %e, "initial connection failed");
                inner.cancel.cancel();
                return Err(e);
            }
        }

        let handler: MessageHandler = Arc::new(handler);
        let dispatcher = tokio::spawn(dispatch(inner.clone(), handler, events_rx, reconnect_tx));
        let supervisor = tokio::spawn(supervise(inner.clone(), reconnect_rx));

        Ok(Self {
            inner,
            tasks: Arc::new(StdMutex::new(vec![dispatcher, supervisor])),
        })
    }

    /// Adds `filter` to the topic set and subscribes it.
    ///
    /// Returns `Ok(false)` without contacting the broker when the filter is
    /// already present. A rejected or unacknowledged subscribe keeps the
    /// filter and repairs the session with a full reconnect; only a failed
    /// repair is reported.
    pub async fn add_topic(&self, filter: impl Into<String>) -> Result<bool> {
        let filter = filter.into();
        let mut state = self.inner.lock_state().await?;

        if !state.topics.insert(filter.clone()) {
            debug!(%filter, "already subscribed");
            return Ok(false);
        }

        let topic = full_topic(&self.inner.options.prefix, &filter);
        let outcome = match state.session.as_deref() {
            Some(session) => {
                self.inner
                    .acknowledged(&topic, session.subscribe(std::slice::from_ref(&topic)))
                    .await
            }
            None => Err(StreamError::subscription(&topic, "no live session")),
        };

        match outcome {
            Ok(()) => info!(%filter, "subscribed"),
            Err(e) => {
                warn!(%filter, error = %e, "subscribe failed, resubscribing from scratch");
                self.inner.reconnect_locked(&mut state).await?;
            }
        }
        Ok(true)
    }

    /// Removes `filter` from the topic set and unsubscribes it.
    ///
    /// Returns `Ok(false)` without contacting the broker when the filter is
    /// absent. Failure handling mirrors [`add_topic`](Self::add_topic).
    pub async fn remove_topic(&self, filter: &str) -> Result<bool> {
        let mut state = self.inner.lock_state().await?;

        if !state.topics.remove(filter) {
            debug!(%filter, "not subscribed");
            return Ok(false);
        }

        let topic = full_topic(&self.inner.options.prefix, filter);
        let outcome = match state.session.as_deref() {
            Some(session) => self.inner.acknowledged(&topic, session.unsubscribe(&topic)).await,
            None => Err(StreamError::subscription(&topic, "no live session")),
        };

        match outcome {
            Ok(()) => info!(%filter, "unsubscribed"),
            Err(e) => {
                warn!(%filter, error = %e, "unsubscribe failed, resubscribing from scratch");
                self.inner.reconnect_locked(&mut state).await?;
            }
        }
        Ok(true)
    }

    /// Closes the session and shuts the background tasks down.
    ///
    /// Any reconnect in progress is abandoned. Once this returns the handler
    /// will not be called again, so it must not be awaited from inside the
    /// handler itself. Calling it twice is harmless; every other operation
    /// fails with [`StreamError::Disconnected`] afterwards.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        info!("stopping stream manager");
        self.inner.cancel.cancel();

        let session = {
            let mut state = self.inner.state.lock().await;
            state.topics.clear();
            state.session.take()
        };
        if let Some(session) = session {
            session.disconnect().await;
        }
        self.inner
            .status
            .send_replace(ConnectionState::Disconnected);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        Ok(())
    }

    /// Current topic filters, in the order they were added.
    pub async fn topics(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock_state().await?.topics.to_vec())
    }

    pub async fn contains_topic(&self, filter: &str) -> Result<bool> {
        Ok(self.inner.lock_state().await?.topics.contains(filter))
    }

    /// Identifier presented on the most recent connect.
    pub async fn client_id(&self) -> Result<Option<String>> {
        Ok(self.inner.lock_state().await?.client_id.clone())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    /// Resolves once the manager stops delivering on its own.
    ///
    /// `Ok` after [`stop`](Self::stop);
    /// [`StreamError::ReconnectExhausted`] when a reconnect cycle gave up.
    pub async fn closed(&self) -> Result<()> {
        let mut status = self.inner.status.subscribe();
        loop {
            if self.inner.cancel.is_cancelled() {
                return Ok(());
            }
            if *status.borrow_and_update() == ConnectionState::Failed {
                return Err(self.inner.failure_error());
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn options(&self) -> &StreamOptions {
        &self.inner.options
    }
}

impl Inner {
    async fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Disconnected);
        }
        let state = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StreamError::Disconnected),
            state = self.state.lock() => state,
        };
        if self.cancel.is_cancelled() {
            return Err(StreamError::Disconnected);
        }
        Ok(state)
    }

    /// Bounds a subscribe/unsubscribe round-trip by the ack timeout.
    async fn acknowledged<F>(&self, topic: &str, request: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let timeout = self.options.ack_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamError::Disconnected),
            outcome = tokio::time::timeout(timeout, request) => match outcome {
                Ok(result) => result,
                Err(_) => Err(StreamError::subscription(
                    topic,
                    format!("no acknowledgment within {timeout:?}"),
                )),
            },
        }
    }

    /// Reconnect cycle with bounded exponential backoff. Caller holds the
    /// state lock.
    async fn reconnect_locked(&self, state: &mut State) -> Result<()> {
        let policy = &self.options.reconnect;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            info!(attempt, attempts, "reconnecting to broker");
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Disconnected),
                outcome = self.connect_locked(state) => outcome,
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                let delay = policy.backoff(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(StreamError::Disconnected),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let last_error =
            last_error.unwrap_or_else(|| StreamError::connect("no reconnect attempt made"));
        error!(attempts, error = %last_error, "giving up reconnecting");
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((attempts, last_error.to_string()));
        self.status.send_replace(ConnectionState::Failed);
        Err(last_error)
    }

    /// Replaces the session: resolve, connect under a new generation, then
    /// subscribe the whole topic set.
    async fn connect_locked(&self, state: &mut State) -> Result<()> {
        self.status.send_replace(ConnectionState::Connecting);

        let generation = self.advance_generation(state);
        if let Some(old) = state.session.take() {
            old.disconnect().await;
        }

        match self.open_session(state, generation).await {
            Ok(session) => {
                state.session = Some(session);
                self.status.send_replace(ConnectionState::Subscribed);
                if let (Some(callback), Some(client_id)) =
                    (&self.options.on_connect, state.client_id.as_deref())
                {
                    callback(client_id);
                }
                Ok(())
            }
            Err(e) => {
                // retire the generation so the failed session's own close
                // cannot be mistaken for a live connection dropping
                self.advance_generation(state);
                self.status.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_session(&self, state: &mut State, generation: u64) -> Result<Box<dyn Session>> {
        let url = self.resolver.resolve().await?;
        if url.trim().is_empty() {
            return Err(StreamError::resolution("discovery returned an empty address"));
        }

        let client_id = match (self.options.client_id, state.client_id.as_ref()) {
            (ClientIdPolicy::Reuse, Some(existing)) => existing.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        state.client_id = Some(client_id.clone());

        let sink = EventSink::new(generation, self.events.clone());
        let timeout = self.options.connect_timeout;
        let session = tokio::time::timeout(timeout, self.connector.connect(&url, &client_id, sink))
            .await
            .map_err(|_| StreamError::connect(format!("broker did not accept within {timeout:?}")))??;

        let filters = state.topics.full_topics(&self.options.prefix);
        if !filters.is_empty() {
            let joined = filters.join(", ");
            if let Err(e) = self.acknowledged(&joined, session.subscribe(&filters)).await {
                session.disconnect().await;
                return Err(e);
            }
        }

        info!(%client_id, generation, topics = filters.len(), "subscribed to broker");
        Ok(session)
    }

    fn failure_error(&self) -> StreamError {
        let failure = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let (attempts, reason) = failure.unwrap_or((0, "unknown".to_string()));
        StreamError::ReconnectExhausted { attempts, reason }
    }

    fn advance_generation(&self, state: &mut State) -> u64 {
        state.generation += 1;
        self.generation.store(state.generation, Ordering::SeqCst);
        state.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn decode(&self, topic: String, payload: Vec<u8>) -> Message {
        if self.options.log_payloads {
            debug!(
                target: "sondestream::payload",
                %topic,
                payload = %String::from_utf8_lossy(&payload),
                "received message"
            );
        }

        let mut message = Message::new(topic, payload);
        if self.options.as_json {
            match serde_json::from_slice(&message.payload) {
                Ok(value) => message.json = Some(value),
                Err(e) => warn!(topic = %message.topic, error = %e, "payload is not JSON, delivering raw"),
            }
        }
        message
    }
}

/// Single consumer of transport events. Calls the handler for messages and
/// forwards live connection losses to the supervisor.
async fn dispatch(
    inner: Arc<Inner>,
    handler: MessageHandler,
    mut events: mpsc::Receiver<TransportEvent>,
    reconnect: mpsc::UnboundedSender<u64>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::Message { topic, payload, .. } => {
                handler(inner.decode(topic, payload));
            }
            TransportEvent::ConnectionLost { generation, reason } => {
                if !inner.is_current(generation) {
                    debug!(generation, %reason, "ignoring loss of a replaced session");
                    continue;
                }
                warn!(generation, %reason, "connection to broker lost");
                inner.status.send_replace(ConnectionState::Disconnected);
                if let Some(callback) = &inner.options.on_disconnect {
                    callback(&reason);
                }
                if reconnect.send(generation).is_err() {
                    break;
                }
            }
        }
    }
    debug!("dispatch loop stopped");
}

/// Runs the reconnect cycle for each connection loss the dispatcher reports.
async fn supervise(inner: Arc<Inner>, mut requests: mpsc::UnboundedReceiver<u64>) {
    loop {
        let generation = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(generation) => generation,
                None => break,
            },
        };

        let mut state = match inner.lock_state().await {
            Ok(state) => state,
            Err(_) => break,
        };
        if state.generation != generation {
            debug!(generation, "session already replaced");
            continue;
        }

        match inner.reconnect_locked(&mut state).await {
            Ok(()) => {}
            Err(StreamError::Disconnected) => break,
            Err(e) => {
                debug!(error = %e, "supervisor cycle failed");
            }
        }
    }
    debug!("supervisor stopped");
}
