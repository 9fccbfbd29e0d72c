use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use super::options::{ClientIdPolicy, ReconnectPolicy, StreamOptions};
use super::topics::{TopicSet, full_topic, strip_prefix};
use super::{ConnectionState, Message, StreamManager};
use crate::testing::{MockBroker, MockConnector, MockResolver, eventually, fast_options};
use crate::utils::error::StreamError;

const BROKER_URL: &str = "wss://broker.example/mqtt";

type Received = Arc<StdMutex<Vec<Message>>>;

async fn start(options: StreamOptions) -> (StreamManager, Arc<MockBroker>, Received) {
    let broker = MockBroker::new();
    let received: Received = Arc::new(StdMutex::new(Vec::new()));
    let sink = received.clone();
    let manager = StreamManager::start_with(
        options,
        move |message| sink.lock().unwrap().push(message),
        MockResolver::new(BROKER_URL),
        Arc::new(MockConnector(broker.clone())),
    )
    .await
    .expect("manager should start");
    (manager, broker, received)
}

fn active(broker: &MockBroker) -> BTreeSet<String> {
    broker.log().active
}

fn expected(prefix: &str, filters: &[String]) -> BTreeSet<String> {
    filters.iter().map(|f| full_topic(prefix, f)).collect()
}

#[test]
fn topic_set_ignores_duplicates() {
    let mut set = TopicSet::from_filters(["alpha", "beta", "alpha"]);
    assert_eq!(set.to_vec(), vec!["alpha", "beta"]);
    assert!(!set.insert("beta".to_string()));
    assert!(set.insert("gamma".to_string()));
    assert!(set.remove("alpha"));
    assert!(!set.remove("alpha"));
    assert_eq!(set.to_vec(), vec!["beta", "gamma"]);
}

#[test]
fn full_topic_joins_with_single_slash() {
    assert_eq!(full_topic("sondes", "#"), "sondes/#");
    assert_eq!(full_topic("sondes/", "/T1234567"), "sondes/T1234567");
    assert_eq!(full_topic("", "T1234567"), "T1234567");
    assert_eq!(strip_prefix("sondes", "sondes/T1234567"), "T1234567");
    assert_eq!(strip_prefix("sondes", "other/T1234567"), "other/T1234567");
    assert_eq!(strip_prefix("sondes", "sondesX/T1"), "sondesX/T1");
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(500),
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));
    assert_eq!(policy.backoff(3), Duration::from_millis(400));
    assert_eq!(policy.backoff(4), Duration::from_millis(500));
    assert_eq!(policy.backoff(40), Duration::from_millis(500));
}

#[test]
fn default_options_subscribe_everything_under_sondes() {
    let options = StreamOptions::default();
    assert_eq!(options.topics, vec!["#"]);
    assert_eq!(options.prefix, "sondes");
    assert_eq!(options.client_id, ClientIdPolicy::Fresh);
    assert!(!options.as_json);
}

#[tokio::test]
async fn start_subscribes_initial_filters_under_prefix() {
    let (manager, broker, _) = start(fast_options()).await;

    let log = broker.log();
    assert_eq!(log.connects.len(), 1);
    assert_eq!(log.connects[0].0, BROKER_URL);
    assert_eq!(log.subscribes, vec![vec!["sondes/#".to_string()]]);
    assert_eq!(manager.state(), ConnectionState::Subscribed);
    assert_eq!(
        manager.client_id().await.unwrap().as_deref(),
        Some(log.connects[0].1.as_str())
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn add_topic_twice_subscribes_once() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    assert!(manager.add_topic("T1234567").await.unwrap());
    assert!(!manager.add_topic("T1234567").await.unwrap());

    let log = broker.log();
    assert_eq!(log.subscribes.len(), 2);
    assert_eq!(log.subscribes[1], vec!["sondes/T1234567".to_string()]);
    assert_eq!(manager.topics().await.unwrap(), vec!["alpha", "T1234567"]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn removing_absent_topic_is_a_noop() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    assert!(!manager.remove_topic("beta").await.unwrap());

    assert!(broker.log().unsubscribes.is_empty());
    assert_eq!(manager.topics().await.unwrap(), vec!["alpha"]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn remove_topic_unsubscribes_that_filter_only() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha", "beta"])).await;

    assert!(manager.remove_topic("alpha").await.unwrap());

    let log = broker.log();
    assert_eq!(log.unsubscribes, vec!["sondes/alpha".to_string()]);
    assert_eq!(log.active, expected("sondes", &["beta".to_string()]));
    assert!(!manager.contains_topic("alpha").await.unwrap());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn messages_reach_handler_in_delivery_order() {
    let (manager, broker, received) = start(fast_options()).await;

    broker.publish("sondes/A", b"A").await;
    broker.publish("sondes/B", b"B").await;
    broker.publish("sondes/C", b"C").await;

    eventually(|| received.lock().unwrap().len() == 3).await;
    let payloads: Vec<Vec<u8>> = received
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.payload.clone())
        .collect();
    assert_eq!(payloads, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);

    manager.stop().await.unwrap();
    assert_eq!(received.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn connection_loss_resubscribes_full_set() {
    let (manager, broker, received) = start(fast_options().with_topics(["alpha", "beta"])).await;

    broker.publish("sondes/alpha", b"before").await;
    eventually(|| received.lock().unwrap().len() == 1).await;

    broker.drop_connection("socket closed").await;
    eventually(|| broker.log().connects.len() == 2).await;
    eventually(|| manager.state() == ConnectionState::Subscribed).await;

    let log = broker.log();
    assert_eq!(
        log.subscribes.last().unwrap(),
        &vec!["sondes/alpha".to_string(), "sondes/beta".to_string()]
    );
    assert_eq!(
        log.active,
        expected("sondes", &manager.topics().await.unwrap())
    );

    broker.publish("sondes/beta", b"after").await;
    eventually(|| received.lock().unwrap().len() == 2).await;
    let payloads: Vec<Vec<u8>> = received
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.payload.clone())
        .collect();
    assert_eq!(payloads, vec![b"before".to_vec(), b"after".to_vec()]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_subscribe_keeps_filter_and_resubscribes() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    broker.reject_subscribes(1);
    assert!(manager.add_topic("gamma").await.unwrap());

    let log = broker.log();
    assert_eq!(log.connects.len(), 2);
    assert_eq!(manager.topics().await.unwrap(), vec!["alpha", "gamma"]);
    assert_eq!(
        log.active,
        expected("sondes", &["alpha".to_string(), "gamma".to_string()])
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_unsubscribe_resubscribes_without_the_filter() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha", "beta"])).await;

    broker.reject_unsubscribes(1);
    assert!(manager.remove_topic("alpha").await.unwrap());

    let log = broker.log();
    assert_eq!(log.connects.len(), 2);
    assert_eq!(log.active, expected("sondes", &["beta".to_string()]));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn unacknowledged_subscribe_times_out_into_reconnect() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    broker.hang_subscribes(1);
    assert!(manager.add_topic("beta").await.unwrap());

    let log = broker.log();
    assert_eq!(log.connects.len(), 2);
    assert_eq!(
        log.active,
        expected("sondes", &["alpha".to_string(), "beta".to_string()])
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn broker_matches_topic_set_after_mixed_changes_and_reconnect() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    manager.add_topic("beta").await.unwrap();
    broker.reject_subscribes(1);
    manager.add_topic("gamma").await.unwrap();
    manager.remove_topic("alpha").await.unwrap();
    broker.reject_unsubscribes(1);
    manager.remove_topic("beta").await.unwrap();
    manager.add_topic("delta").await.unwrap();

    let connects = broker.log().connects.len();
    broker.drop_connection("keep-alive timeout").await;
    eventually(|| broker.log().connects.len() == connects + 1).await;
    eventually(|| manager.state() == ConnectionState::Subscribed).await;

    let topics = manager.topics().await.unwrap();
    assert_eq!(topics, vec!["gamma", "delta"]);
    assert_eq!(active(&broker), expected("sondes", &topics));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_add_and_remove_leave_a_whole_outcome() {
    for _ in 0..20 {
        let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

        let adder = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.add_topic("x").await })
        };
        let remover = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.remove_topic("x").await })
        };
        adder.await.unwrap().unwrap();
        remover.await.unwrap().unwrap();

        let topics = manager.topics().await.unwrap();
        let present = topics.iter().any(|t| t == "x");
        let expected_topics: Vec<String> = if present {
            vec!["alpha".to_string(), "x".to_string()]
        } else {
            vec!["alpha".to_string()]
        };
        assert_eq!(topics, expected_topics);
        assert_eq!(active(&broker), expected("sondes", &topics));

        manager.stop().await.unwrap();
    }
}

#[tokio::test]
async fn stale_connection_loss_is_ignored() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;
    let old_sink = broker.sink();

    broker.reject_subscribes(1);
    manager.add_topic("beta").await.unwrap();
    assert_eq!(broker.log().connects.len(), 2);

    old_sink.connection_lost("late close of replaced session").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.log().connects.len(), 2);
    assert_eq!(manager.state(), ConnectionState::Subscribed);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn replaced_session_messages_are_still_delivered() {
    let (manager, broker, received) = start(fast_options().with_topics(["alpha"])).await;
    let old_sink = broker.sink();

    broker.reject_subscribes(1);
    manager.add_topic("beta").await.unwrap();
    assert_eq!(broker.log().connects.len(), 2);

    old_sink.message("sondes/alpha", b"queued".to_vec()).await;
    eventually(|| received.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, "sondes/alpha");
    drop(received);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    broker.reject_subscribes(1);
    broker.refuse_connects(10);
    let err = manager.add_topic("beta").await.unwrap_err();

    assert!(matches!(err, StreamError::Connect(_)));
    assert_eq!(broker.log().connect_attempts, 1 + 3);
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert!(manager.contains_topic("beta").await.unwrap());

    // the broker is back: the next change reconnects with the full set
    broker.refuse_connects(0);
    assert!(manager.add_topic("gamma").await.unwrap());
    assert_eq!(manager.state(), ConnectionState::Subscribed);
    assert_eq!(
        active(&broker),
        expected(
            "sondes",
            &["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
        )
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn fresh_client_id_on_every_connect() {
    let (manager, broker, _) = start(fast_options()).await;

    broker.drop_connection("eof").await;
    eventually(|| broker.log().connects.len() == 2).await;

    let log = broker.log();
    assert_ne!(log.connects[0].1, log.connects[1].1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn reused_client_id_survives_reconnect() {
    let options = fast_options().with_client_id_policy(ClientIdPolicy::Reuse);
    let (manager, broker, _) = start(options).await;

    broker.drop_connection("eof").await;
    eventually(|| broker.log().connects.len() == 2).await;

    let log = broker.log();
    assert_eq!(log.connects[0].1, log.connects[1].1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_resolves_the_endpoint_again() {
    let broker = MockBroker::new();
    let resolver = MockResolver::new(BROKER_URL);
    let manager = StreamManager::start_with(
        fast_options(),
        |_| {},
        resolver.clone(),
        Arc::new(MockConnector(broker.clone())),
    )
    .await
    .unwrap();

    resolver.set_url("wss://other-broker.example/mqtt");
    broker.drop_connection("eof").await;
    eventually(|| broker.log().connects.len() == 2).await;

    assert_eq!(resolver.calls(), 2);
    assert_eq!(broker.log().connects[1].0, "wss://other-broker.example/mqtt");

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn start_refuses_empty_endpoint() {
    let broker = MockBroker::new();
    let result = StreamManager::start_with(
        fast_options(),
        |_| {},
        MockResolver::new("  "),
        Arc::new(MockConnector(broker.clone())),
    )
    .await;

    assert!(matches!(result, Err(StreamError::Resolution(_))));
    assert_eq!(broker.log().connect_attempts, 0);
}

#[tokio::test]
async fn start_fails_when_broker_refuses() {
    let broker = MockBroker::new();
    broker.refuse_connects(1);
    let result = StreamManager::start_with(
        fast_options(),
        |_| {},
        MockResolver::new(BROKER_URL),
        Arc::new(MockConnector(broker.clone())),
    )
    .await;

    assert!(matches!(result, Err(StreamError::Connect(_))));
    // no retry on the initial connect
    assert_eq!(broker.log().connect_attempts, 1);
}

#[tokio::test]
async fn start_fails_when_initial_subscribe_rejected() {
    let broker = MockBroker::new();
    broker.reject_subscribes(1);
    let result = StreamManager::start_with(
        fast_options(),
        |_| {},
        MockResolver::new(BROKER_URL),
        Arc::new(MockConnector(broker.clone())),
    )
    .await;

    assert!(matches!(result, Err(StreamError::Subscription { .. })));
    assert_eq!(broker.log().disconnects, 1);
}

#[tokio::test]
async fn stopped_manager_rejects_operations_and_drops_messages() {
    let (manager, broker, received) = start(fast_options()).await;
    let sink = broker.sink();

    manager.stop().await.unwrap();
    assert!(manager.is_stopped());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(broker.log().disconnects, 1);

    assert!(matches!(
        manager.add_topic("alpha").await,
        Err(StreamError::Disconnected)
    ));
    assert!(matches!(
        manager.remove_topic("#").await,
        Err(StreamError::Disconnected)
    ));
    assert!(matches!(
        manager.topics().await,
        Err(StreamError::Disconnected)
    ));

    sink.message("sondes/late", b"late".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(received.lock().unwrap().is_empty());

    // second stop is harmless
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn as_json_decodes_payloads() {
    let (manager, broker, received) = start(fast_options().with_as_json(true)).await;

    broker
        .publish("sondes/T1", br#"{"serial":"T1","alt":12000}"#)
        .await;
    broker.publish("sondes/T2", b"not json").await;

    eventually(|| received.lock().unwrap().len() == 2).await;
    let messages = received.lock().unwrap().clone();
    assert_eq!(messages[0].json.as_ref().unwrap()["alt"], 12000);
    assert_eq!(messages[0].payload_str(), Some(r#"{"serial":"T1","alt":12000}"#));
    assert!(messages[1].json.is_none());
    assert_eq!(messages[1].payload, b"not json".to_vec());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_callbacks_fire() {
    let connected = Arc::new(AtomicUsize::new(0));
    let reasons = Arc::new(StdMutex::new(Vec::<String>::new()));

    let options = {
        let connected = connected.clone();
        let reasons = reasons.clone();
        fast_options()
            .with_on_connect(move |client_id| {
                assert!(!client_id.is_empty());
                connected.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_disconnect(move |reason| reasons.lock().unwrap().push(reason.to_string()))
    };
    let (manager, broker, _) = start(options).await;
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    broker.drop_connection("network unreachable").await;
    eventually(|| connected.load(Ordering::SeqCst) == 2).await;
    assert_eq!(
        reasons.lock().unwrap().clone(),
        vec!["network unreachable".to_string()]
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn state_watch_sees_reconnect() {
    let (manager, broker, _) = start(fast_options()).await;
    let mut watch = manager.watch_state();
    assert_eq!(*watch.borrow_and_update(), ConnectionState::Subscribed);

    broker.refuse_connects(1);
    broker.drop_connection("eof").await;

    tokio::time::timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("state change notified")
        .unwrap();
    eventually(|| manager.state() == ConnectionState::Subscribed).await;
    assert_eq!(broker.log().connect_attempts, 3);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_reconnect_after_loss_is_reported() {
    let (manager, broker, _) = start(fast_options().with_topics(["alpha"])).await;

    broker.refuse_connects(3);
    broker.drop_connection("broker restarting").await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), manager.closed())
        .await
        .expect("failure reported in time");
    match outcome {
        Err(StreamError::ReconnectExhausted { attempts, reason }) => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("connection refused"), "{reason}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(broker.log().connect_attempts, 1 + 3);
    assert!(!manager.is_stopped());

    // the broker is back: a topic change brings the stream up again
    assert!(manager.add_topic("beta").await.unwrap());
    assert_eq!(manager.state(), ConnectionState::Subscribed);
    assert_eq!(
        active(&broker),
        expected("sondes", &["alpha".to_string(), "beta".to_string()])
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn closed_resolves_ok_after_stop() {
    let (manager, _broker, _) = start(fast_options()).await;

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.closed().await })
    };
    manager.stop().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("closed resolved")
        .unwrap();
    assert!(outcome.is_ok());
}
