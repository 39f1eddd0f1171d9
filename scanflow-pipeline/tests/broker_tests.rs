//! Broker client behavior across connection loss

mod helpers;

use async_trait::async_trait;
use helpers::wait_until;
use scanflow_common::messages::OcrRequest;
use scanflow_common::{ConsumerState, Envelope, EventBus, QueueNames};
use scanflow_pipeline::broker::{
    BrokerClient, DeliveryHandler, Disposition, InMemoryTransport, ReconnectPolicy, TransportError,
    PREFETCH,
};
use serde_json::Map;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Records payloads; optionally holds the first delivery until released
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Vec<u8>>>,
    hold_first: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Recorder {
    fn holding(release: oneshot::Receiver<()>) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            hold_first: Mutex::new(Some(release)),
        }
    }

    fn seen(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryHandler for Recorder {
    async fn handle_delivery(&self, _queue: &str, payload: &[u8]) -> Disposition {
        self.seen.lock().unwrap().push(payload.to_vec());
        let hold = self.hold_first.lock().unwrap().take();
        if let Some(release) = hold {
            let _ = release.await;
        }
        Disposition::Ack
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
        jitter: 0.0,
        alert_after_attempts: 3,
    }
}

async fn connected_client(transport: &InMemoryTransport) -> Arc<BrokerClient> {
    let client = Arc::new(BrokerClient::new(
        Arc::new(transport.clone()),
        QueueNames::new(""),
        fast_policy(),
        EventBus::new(64),
    ));
    client.connect().await.unwrap();
    client
}

fn job(n: u64) -> Envelope {
    Envelope::from_payload(&OcrRequest {
        file_path: format!("/scans/{}.png", n),
    })
    .unwrap()
}

#[tokio::test]
async fn test_consumer_resubscribes_and_redeclares_after_disconnect() {
    let transport = InMemoryTransport::new();
    let client = connected_client(&transport).await;
    client.declare_queue("audit").await.unwrap();

    let recorder = Arc::new(Recorder::default());
    client.consume("jobs", recorder.clone(), None).await.unwrap();

    client.publish("jobs", &job(1)).await.unwrap();
    wait_until("first job", || recorder.seen().len() == 1).await;

    transport.drop_connection();
    wait_until("resubscribe", || {
        transport
            .subscriptions()
            .iter()
            .filter(|(queue, _)| queue == "jobs")
            .count()
            == 2
    })
    .await;

    // Every known queue declared again on the new connection
    let declarations = transport.declarations();
    for queue in ["audit", "jobs"] {
        assert!(
            declarations.iter().filter(|q| q.as_str() == queue).count() >= 2,
            "{} not re-declared: {:?}",
            queue,
            declarations
        );
    }
    assert!(transport
        .subscriptions()
        .iter()
        .all(|(_, prefetch)| *prefetch == PREFETCH));

    client.publish("jobs", &job(2)).await.unwrap();
    wait_until("second job", || recorder.seen().len() == 2).await;
    assert_eq!(
        client.consumer_states().await,
        vec![("jobs".to_string(), ConsumerState::Running)]
    );

    client.close().await.unwrap();
    assert_eq!(
        client.consumer_states().await,
        vec![("jobs".to_string(), ConsumerState::Stopped)]
    );
}

#[tokio::test]
async fn test_publish_reconnects_exactly_once() {
    let transport = InMemoryTransport::new();
    let client = connected_client(&transport).await;
    client.declare_queue("jobs").await.unwrap();
    assert_eq!(transport.connect_attempts(), 1);

    transport.drop_connection();
    client.publish("jobs", &job(1)).await.unwrap();
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(transport.published("jobs").len(), 1);

    transport.drop_connection();
    transport.fail_next_connects(1);
    let err = client.publish("jobs", &job(2)).await.unwrap_err();
    assert!(matches!(err, TransportError::Connect(_)));
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(transport.published("jobs").len(), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_fails_fast_while_consumer_backs_off() {
    let transport = InMemoryTransport::new();
    let client = connected_client(&transport).await;
    client
        .consume("jobs", Arc::new(Recorder::default()), None)
        .await
        .unwrap();
    wait_until("subscribed", || transport.subscriptions().len() == 1).await;

    // Broker stays down: the consume loop keeps retrying with backoff
    transport.fail_next_connects(u32::MAX);
    transport.drop_connection();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.consumer_states().await != vec![("jobs".to_string(), ConsumerState::Reconnecting)] {
        assert!(tokio::time::Instant::now() < deadline, "consumer never started reconnecting");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let outcome = tokio::time::timeout(Duration::from_secs(2), client.publish("jobs", &job(1)))
        .await
        .expect("publish blocked behind consumer recovery");
    assert!(matches!(outcome, Err(TransportError::Connect(_))));
    assert!(transport.published("jobs").is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_message_redelivered_and_settled_once() {
    let transport = InMemoryTransport::new();
    let client = connected_client(&transport).await;

    let (release, hold) = oneshot::channel();
    let recorder = Arc::new(Recorder::holding(hold));
    client.consume("jobs", recorder.clone(), None).await.unwrap();

    client.publish("jobs", &job(7)).await.unwrap();
    wait_until("delivery in flight", || recorder.seen().len() == 1).await;

    // Connection drops while the handler still holds the message
    transport.drop_connection();
    release.send(()).unwrap();

    wait_until("redelivery", || recorder.seen().len() == 2).await;
    wait_until("settled", || transport.unacked_count() == 0).await;

    let seen = recorder.seen();
    assert_eq!(seen[0], seen[1]);

    let settlements = transport.settlements();
    let tags: HashSet<u64> = settlements.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(settlements.len(), 1);
    assert_eq!(tags.len(), settlements.len());
    assert_eq!(settlements[0].1, Disposition::Ack);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_connect_retries_until_broker_available() {
    let transport = InMemoryTransport::new();
    transport.fail_next_connects(4);
    let client = BrokerClient::new(
        Arc::new(transport.clone()),
        QueueNames::new("dev_"),
        fast_policy(),
        EventBus::new(64),
    );

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(transport.connect_attempts(), 5);

    client.declare_queue(&client.queue("events")).await.unwrap();
    assert_eq!(client.declared_queues().await, vec!["dev_events".to_string()]);

    client.close().await.unwrap();
    assert!(client.is_closed());
    assert!(matches!(
        client.publish("dev_events", &Envelope::new("X", Map::new()).unwrap()).await,
        Err(TransportError::Closed)
    ));
}
