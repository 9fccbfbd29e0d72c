//! MQTT session over rumqttc.
//!
//! `connect` drives the event loop inline until the CONNACK arrives, then
//! hands it to a background task that forwards publishes to the event sink
//! and acknowledgments to the session. Subscribe and unsubscribe calls are
//! serialized by the stream manager's lock, so a session only ever has one
//! request waiting for its acknowledgment.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode, Transport,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::{Connector, EventSink, Session};
use crate::utils::error::{Result, StreamError};

/// Largest packet accepted in either direction.
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// How long `disconnect` waits for the DISCONNECT to be flushed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Ack {
    Subscribe(Vec<SubscribeReasonCode>),
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct MqttConnector {
    keep_alive: Duration,
    request_capacity: usize,
}

impl MqttConnector {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            request_capacity: 64,
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Maps a broker URL onto rumqttc options.
///
/// `ws://` and `wss://` keep the whole URL as the broker address, which is
/// how rumqttc expects WebSocket endpoints (path and query included, as in a
/// presigned URL). `mqtt://`/`tcp://` and `mqtts://`/`ssl://` use host and
/// port only.
pub fn mqtt_options(url: &str, client_id: &str, keep_alive: Duration) -> Result<MqttOptions> {
    let parsed =
        Url::parse(url).map_err(|e| StreamError::connect(format!("invalid broker url: {e}")))?;

    let mut options = match parsed.scheme() {
        "wss" => {
            let mut options =
                MqttOptions::new(client_id, parsed.as_str(), parsed.port().unwrap_or(443));
            options.set_transport(Transport::wss_with_default_config());
            options
        }
        "ws" => {
            let mut options =
                MqttOptions::new(client_id, parsed.as_str(), parsed.port().unwrap_or(80));
            options.set_transport(Transport::Ws);
            options
        }
        "mqtt" | "tcp" => MqttOptions::new(client_id, host_of(&parsed)?, parsed.port().unwrap_or(1883)),
        "mqtts" | "ssl" => {
            let mut options =
                MqttOptions::new(client_id, host_of(&parsed)?, parsed.port().unwrap_or(8883));
            options.set_transport(Transport::tls_with_default_config());
            options
        }
        other => {
            return Err(StreamError::connect(format!(
                "unsupported broker url scheme '{other}'"
            )));
        }
    };

    options
        .set_keep_alive(keep_alive.max(Duration::from_secs(1)))
        .set_clean_session(true)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    Ok(options)
}

fn host_of(url: &Url) -> Result<String> {
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| StreamError::connect(format!("broker url '{url}' has no host")))
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        url: &str,
        client_id: &str,
        sink: EventSink,
    ) -> Result<Box<dyn Session>> {
        let options = mqtt_options(url, client_id, self.keep_alive)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.request_capacity);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(StreamError::connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => return Err(StreamError::connect(e.to_string())),
            }
        }
        info!(%client_id, generation = sink.generation(), "MQTT session established");

        let (ack_tx, ack_rx) = mpsc::channel(8);
        let task = tokio::spawn(drive(eventloop, sink, ack_tx));

        Ok(Box::new(MqttSession {
            client,
            acks: Mutex::new(ack_rx),
            task: StdMutex::new(Some(task)),
        }))
    }
}

/// Pumps the event loop until the connection drops or the manager goes away.
async fn drive(mut eventloop: EventLoop, sink: EventSink, acks: mpsc::Sender<Ack>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !sink.message(publish.topic, publish.payload.to_vec()).await {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                if acks.try_send(Ack::Subscribe(suback.return_codes)).is_err() {
                    debug!(pkid = suback.pkid, "SUBACK with nobody waiting");
                }
            }
            Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                if acks.try_send(Ack::Unsubscribe).is_err() {
                    debug!(pkid = unsuback.pkid, "UNSUBACK with nobody waiting");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                sink.connection_lost("broker sent DISCONNECT").await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc would reconnect on the next poll with the same
                // identity; the manager owns reconnects, so stop here
                sink.connection_lost(e.to_string()).await;
                break;
            }
        }
    }
    debug!(generation = sink.generation(), "MQTT event loop stopped");
}

pub struct MqttSession {
    client: AsyncClient,
    acks: Mutex<mpsc::Receiver<Ack>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&self, filters: &[String]) -> Result<()> {
        let joined = filters.join(", ");
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}

        self.client
            .subscribe_many(
                filters
                    .iter()
                    .map(|f| SubscribeFilter::new(f.clone(), QoS::AtMostOnce)),
            )
            .await
            .map_err(|e| StreamError::subscription(&joined, e.to_string()))?;

        match acks.recv().await {
            Some(Ack::Subscribe(codes)) => {
                match codes
                    .iter()
                    .position(|c| matches!(c, SubscribeReasonCode::Failure))
                {
                    Some(idx) => {
                        let filter = filters.get(idx).map(String::as_str).unwrap_or(&joined);
                        Err(StreamError::subscription(filter, "rejected by broker"))
                    }
                    None => Ok(()),
                }
            }
            Some(Ack::Unsubscribe) => Err(StreamError::subscription(
                &joined,
                "got UNSUBACK while waiting for SUBACK",
            )),
            None => Err(StreamError::subscription(
                &joined,
                "connection closed before SUBACK",
            )),
        }
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}

        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| StreamError::subscription(filter, e.to_string()))?;

        match acks.recv().await {
            Some(Ack::Unsubscribe) => Ok(()),
            Some(Ack::Subscribe(_)) => Err(StreamError::subscription(
                filter,
                "got SUBACK while waiting for UNSUBACK",
            )),
            None => Err(StreamError::subscription(
                filter,
                "connection closed before UNSUBACK",
            )),
        }
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!(error = %e, "could not queue MQTT DISCONNECT");
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(DISCONNECT_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
