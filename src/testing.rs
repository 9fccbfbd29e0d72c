//! In-memory broker, resolver and helpers shared by the unit tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::resolver::Resolve;
use crate::stream::{ReconnectPolicy, StreamOptions};
use crate::transport::{Connector, EventSink, Session};
use crate::utils::error::{Result, StreamError};

/// Everything the fake broker was asked to do.
#[derive(Debug, Default, Clone)]
pub(crate) struct BrokerLog {
    /// `(url, client_id)` of every accepted connection.
    pub connects: Vec<(String, String)>,
    pub connect_attempts: usize,
    pub subscribes: Vec<Vec<String>>,
    pub unsubscribes: Vec<String>,
    /// Subscriptions held by the latest session.
    pub active: BTreeSet<String>,
    pub disconnects: usize,
}

#[derive(Default)]
pub(crate) struct MockBroker {
    log: StdMutex<BrokerLog>,
    sink: StdMutex<Option<EventSink>>,
    reject_subscribes: AtomicUsize,
    reject_unsubscribes: AtomicUsize,
    refuse_connects: AtomicUsize,
    hang_subscribes: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> BrokerLog {
        self.log.lock().unwrap().clone()
    }

    pub fn reject_subscribes(&self, count: usize) {
        self.reject_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn reject_unsubscribes(&self, count: usize) {
        self.reject_unsubscribes.store(count, Ordering::SeqCst);
    }

    pub fn refuse_connects(&self, count: usize) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// The next `count` subscribes never get an acknowledgment.
    pub fn hang_subscribes(&self, count: usize) {
        self.hang_subscribes.store(count, Ordering::SeqCst);
    }

    /// Sink of the most recent session.
    pub fn sink(&self) -> EventSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("no session has been opened")
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) {
        self.sink().message(topic, payload.to_vec()).await;
    }

    pub async fn drop_connection(&self, reason: &str) {
        self.sink().connection_lost(reason).await;
    }
}

pub(crate) struct MockConnector(pub Arc<MockBroker>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &str,
        client_id: &str,
        sink: EventSink,
    ) -> Result<Box<dyn Session>> {
        let broker = self.0.clone();
        broker.log.lock().unwrap().connect_attempts += 1;
        if take_one(&broker.refuse_connects) {
            return Err(StreamError::connect("connection refused"));
        }

        {
            let mut log = broker.log.lock().unwrap();
            log.connects.push((url.to_string(), client_id.to_string()));
            log.active.clear();
        }
        *broker.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(MockSession { broker }))
    }
}

struct MockSession {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, filters: &[String]) -> Result<()> {
        self.broker
            .log
            .lock()
            .unwrap()
            .subscribes
            .push(filters.to_vec());

        if take_one(&self.broker.hang_subscribes) {
            std::future::pending::<()>().await;
        }
        if take_one(&self.broker.reject_subscribes) {
            return Err(StreamError::subscription(filters.join(", "), "rejected"));
        }

        let mut log = self.broker.log.lock().unwrap();
        log.active.extend(filters.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.broker
            .log
            .lock()
            .unwrap()
            .unsubscribes
            .push(filter.to_string());

        if take_one(&self.broker.reject_unsubscribes) {
            return Err(StreamError::subscription(filter, "rejected"));
        }

        self.broker.log.lock().unwrap().active.remove(filter);
        Ok(())
    }

    async fn disconnect(&self) {
        self.broker.log.lock().unwrap().disconnects += 1;
    }
}

/// Resolver answering with a fixed, replaceable URL.
pub(crate) struct MockResolver {
    url: StdMutex<String>,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: StdMutex::new(url.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for MockResolver {
    async fn resolve(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.url.lock().unwrap().clone())
    }
}

/// Options with near-zero backoff so failure paths run quickly.
pub(crate) fn fast_options() -> StreamOptions {
    StreamOptions::default()
        .with_reconnect_policy(ReconnectPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
        .with_ack_timeout(Duration::from_millis(200))
        .with_connect_timeout(Duration::from_millis(200))
}

/// Polls `check` for up to two seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
