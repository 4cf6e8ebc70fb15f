use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use broker::{BrokerSettings, MemoryTransport, MessageBroker};
use pipeline::{DeliveryHandler, Disposition, ExchangeName, QueueName, RoutingKey};
use tokio::sync::watch;

fn names() -> (ExchangeName, QueueName, RoutingKey) {
    (
        ExchangeName::new("index").unwrap(),
        QueueName::new("backlog").unwrap(),
        RoutingKey::new("index.crawler").unwrap(),
    )
}

/// Records bodies and answers by content: `ok` acks, `panic` panics,
/// anything else rejects.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl DeliveryHandler for Recorder {
    async fn on_delivery(&self, body: &[u8]) -> Disposition {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.seen.lock().unwrap().push(body.to_vec());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match body {
            b"ok" => Disposition::Ack,
            b"panic" => panic!("handler blew up"),
            _ => Disposition::Reject,
        }
    }
}

async fn wait_for(transport: &MemoryTransport, recorder: &Recorder, count: usize) {
    for _ in 0..200 {
        if recorder.seen.lock().unwrap().len() >= count && transport.queue_depth("backlog") == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {count} deliveries");
}

#[tokio::test]
async fn subscription_acks_rejects_and_survives_panics() {
    let transport = MemoryTransport::new();
    let broker = MessageBroker::new(Arc::new(transport.clone()), BrokerSettings::default()).unwrap();
    let (exchange, queue, key) = names();
    broker.bind(&exchange, &queue, &key).await.unwrap();

    for body in ["ok", "bad", "panic", "ok"] {
        broker
            .publish(&exchange, &key, body.as_bytes().to_vec(), true)
            .await
            .unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let (stop, shutdown) = watch::channel(false);
    let subscription = {
        let broker = broker.clone();
        let queue = queue.clone();
        let handler = Arc::clone(&recorder) as Arc<dyn DeliveryHandler>;
        tokio::spawn(async move { broker.subscribe(&queue, handler, shutdown).await })
    };

    wait_for(&transport, &recorder, 4).await;
    stop.send(true).unwrap();
    let stats = subscription.await.unwrap().unwrap();

    assert_eq!(stats.acked, 2);
    assert_eq!(stats.rejected, 2);
    assert_eq!(transport.rejected("backlog"), 2);
    assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(transport.queue_depth("backlog"), 0);
}

#[tokio::test]
async fn bind_is_idempotent() {
    let transport = MemoryTransport::new();
    let broker = MessageBroker::new(Arc::new(transport.clone()), BrokerSettings::default()).unwrap();
    let (exchange, queue, key) = names();

    broker.bind(&exchange, &queue, &key).await.unwrap();
    broker.bind(&exchange, &queue, &key).await.unwrap();

    assert_eq!(
        transport.bindings("index"),
        vec![("backlog".to_string(), "index.crawler".to_string())]
    );
}

#[tokio::test]
async fn pools_are_bounded_and_reused() {
    let transport = MemoryTransport::new();
    let broker = MessageBroker::new(Arc::new(transport.clone()), BrokerSettings::default()).unwrap();
    let (exchange, queue, key) = names();
    broker.bind(&exchange, &queue, &key).await.unwrap();

    for _ in 0..20 {
        broker.publish(&exchange, &key, b"x".to_vec(), true).await.unwrap();
    }

    let connections = broker.connection_pool().status();
    let channels = broker.channel_pool().status();
    assert_eq!(connections.max_size, 2);
    assert_eq!(channels.max_size, 10);
    assert_eq!(connections.size, 1);
    assert_eq!(channels.size, 1);
    assert_eq!(transport.connections_opened(), 1);
    assert_eq!(transport.queue_depth("backlog"), 20);
}

#[tokio::test]
async fn subscription_stops_on_shutdown_while_idle() {
    let transport = MemoryTransport::new();
    let broker = MessageBroker::new(Arc::new(transport), BrokerSettings::default()).unwrap();
    let (exchange, queue, key) = names();
    broker.bind(&exchange, &queue, &key).await.unwrap();

    let (stop, shutdown) = watch::channel(false);
    let handler: Arc<dyn DeliveryHandler> = Arc::new(Recorder::default());
    let subscription = tokio::spawn(async move { broker.subscribe(&queue, handler, shutdown).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    stop.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(1), subscription)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.acked + stats.rejected, 0);
}

#[tokio::test]
async fn exhausted_channel_pool_makes_callers_wait() {
    let transport = MemoryTransport::new();
    let settings = BrokerSettings {
        max_connections: 1,
        max_channels: 1,
    };
    let broker = MessageBroker::new(Arc::new(transport.clone()), settings).unwrap();
    let (exchange, queue, key) = names();
    broker.bind(&exchange, &queue, &key).await.unwrap();

    let held = broker.channel_pool().get().await.unwrap();
    let blocked =
        tokio::time::timeout(Duration::from_millis(50), broker.publish(&exchange, &key, b"x".to_vec(), true))
            .await;
    assert!(blocked.is_err());

    drop(held);
    tokio::time::timeout(Duration::from_millis(50), broker.publish(&exchange, &key, b"x".to_vec(), true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.queue_depth("backlog"), 1);
}
