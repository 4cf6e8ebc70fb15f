//! In-process transport.
//!
//! Implements the same exchange, queue and settlement semantics as a
//! networked broker for single-process deployments and tests: topic, direct
//! and fanout routing, idempotent declarations, per-channel prefetch and
//! requeue of deliveries that are dropped without being settled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pipeline::{ExchangeName, QueueName, RoutingKey};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::BrokerError;
use crate::topic::topic_matches;
use crate::transport::{
    Acker, Channel, Connection, Consumer, Delivery, DeliveryMode, ExchangeKind, Transport,
};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub persistent: bool,
    pub redelivered: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

impl ExchangeState {
    fn routes(&self, routing_key: &str) -> Vec<&str> {
        let mut queues: Vec<&str> = Vec::new();
        for (queue, pattern) in &self.bindings {
            let hit = match self.kind {
                ExchangeKind::Direct => pattern == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
            };
            if hit && !queues.contains(&queue.as_str()) {
                queues.push(queue);
            }
        }
        queues
    }
}

struct QueueState {
    durable: bool,
    messages: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
    rejected: AtomicU64,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            rejected: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_back(&self, message: QueuedMessage) {
        self.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: QueuedMessage) {
        self.lock().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedMessage> {
        self.lock().pop_front()
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, Arc<QueueState>>,
}

/// Shared in-process bus. Clones refer to the same exchanges and queues.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
    connections_opened: Arc<AtomicU64>,
    next_tag: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueState>, BrokerError> {
        self.lock()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Ready (undelivered) messages in `queue`; zero if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queue(queue)
            .map(|q| {
                let depth = q.lock().len();
                depth
            })
            .unwrap_or(0)
    }

    /// Copies of the ready messages in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<QueuedMessage> {
        self.queue(queue)
            .map(|q| {
                let messages = q.lock().iter().cloned().collect();
                messages
            })
            .unwrap_or_default()
    }

    /// Messages rejected without requeue from `queue`.
    pub fn rejected(&self, queue: &str) -> u64 {
        self.queue(queue)
            .map(|q| q.rejected.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Queues bound to `exchange`, with their binding keys.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::PreconditionFailed {
                    name: name.to_string(),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => Err(BrokerError::PreconditionFailed {
                name: name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), Arc::new(QueueState::new(durable)));
                Ok(())
            }
        }
    }

    fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str, body: Vec<u8>, mode: DeliveryMode) -> Result<usize, BrokerError> {
        let targets: Vec<Arc<QueueState>> = {
            let state = self.lock();
            let exchange_state = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            exchange_state
                .routes(routing_key)
                .into_iter()
                .filter_map(|queue| state.queues.get(queue).cloned())
                .collect()
        };

        for queue in &targets {
            queue.push_back(QueuedMessage {
                body: body.clone(),
                routing_key: routing_key.to_string(),
                persistent: mode == DeliveryMode::Persistent,
                redelivered: false,
            });
        }
        Ok(targets.len())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryConnection {
            transport: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

pub struct MemoryConnection {
    transport: MemoryTransport,
    open: AtomicBool,
}

impl MemoryConnection {
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Connection("connection is closed".into()));
        }
        Ok(Arc::new(MemoryChannel {
            transport: self.transport.clone(),
            prefetch: AtomicU16::new(0),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

pub struct MemoryChannel {
    transport: MemoryTransport,
    prefetch: AtomicU16,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &ExchangeName,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.transport.declare_exchange(name.as_str(), kind, durable)
    }

    async fn declare_queue(&self, name: &QueueName, durable: bool) -> Result<(), BrokerError> {
        self.transport.declare_queue(name.as_str(), durable)
    }

    async fn bind_queue(
        &self,
        queue: &QueueName,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
    ) -> Result<(), BrokerError> {
        self.transport
            .bind(queue.as_str(), exchange.as_str(), routing_key.as_str())
    }

    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        body: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        let routed = self
            .transport
            .route(exchange.as_str(), routing_key.as_str(), body, mode)?;
        if routed == 0 {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message matched no binding");
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(&self, queue: &QueueName) -> Result<Consumer, BrokerError> {
        let state = self.transport.queue(queue.as_str())?;
        let permits = match self.prefetch.load(Ordering::Relaxed) {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        let (sender, receiver) = mpsc::channel(1);
        tokio::spawn(dispatch(
            queue.to_string(),
            state,
            Arc::new(Semaphore::new(permits)),
            Arc::clone(&self.transport.next_tag),
            sender,
        ));
        Ok(Consumer::new(receiver))
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Moves messages from `queue` to one consumer, holding a prefetch permit for
/// every unsettled delivery.
async fn dispatch(
    name: String,
    queue: Arc<QueueState>,
    permits: Arc<Semaphore>,
    tags: Arc<AtomicU64>,
    sender: mpsc::Sender<Delivery>,
) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = sender.closed() => break,
        };

        let message = loop {
            let notified = queue.notify.notified();
            if let Some(message) = queue.pop() {
                break Some(message);
            }
            tokio::select! {
                _ = notified => {}
                _ = sender.closed() => break None,
            }
        };
        let Some(message) = message else {
            break;
        };

        let tag = tags.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(queue = %name, delivery_tag = tag, "Dispatching message");
        let delivery = Delivery::new(
            tag,
            message.body.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                tag,
                queue: Arc::clone(&queue),
                message: Mutex::new(Some(message)),
                _permit: permit,
            }),
        );
        // A failed send drops the delivery, which requeues it.
        if sender.send(delivery).await.is_err() {
            break;
        }
    }
    debug!(queue = %name, "Consumer dispatch stopped");
}

struct MemoryAcker {
    tag: u64,
    queue: Arc<QueueState>,
    message: Mutex<Option<QueuedMessage>>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn take(&self) -> Option<QueuedMessage> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.take().map(drop).ok_or(BrokerError::AlreadySettled(self.tag))
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        let message = self.take().ok_or(BrokerError::AlreadySettled(self.tag))?;
        if requeue {
            self.queue.push_front(QueuedMessage {
                redelivered: true,
                ..message
            });
        } else {
            self.queue.rejected.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.take() {
            self.queue.push_front(QueuedMessage {
                redelivered: true,
                ..message
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn exchange() -> ExchangeName {
        ExchangeName::new("index").unwrap()
    }

    fn queue(name: &str) -> QueueName {
        QueueName::new(name).unwrap()
    }

    fn key(k: &str) -> RoutingKey {
        RoutingKey::new(k).unwrap()
    }

    async fn channel(transport: &MemoryTransport) -> Arc<dyn Channel> {
        transport.connect().await.unwrap().open_channel().await.unwrap()
    }

    async fn bound(transport: &MemoryTransport, q: &str, pattern: &str) -> Arc<dyn Channel> {
        let channel = channel(transport).await;
        channel
            .declare_exchange(&exchange(), ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel.declare_queue(&queue(q), true).await.unwrap();
        channel.bind_queue(&queue(q), &exchange(), &key(pattern)).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn topic_routing_fans_out_to_matching_queues() {
        let transport = MemoryTransport::new();
        let channel = bound(&transport, "backlog", "index.#").await;
        channel.declare_queue(&queue("builder"), true).await.unwrap();
        channel
            .bind_queue(&queue("builder"), &exchange(), &key("*.build"))
            .await
            .unwrap();

        channel
            .publish(&exchange(), &key("index.crawler"), b"a".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();
        channel
            .publish(&exchange(), &key("index.build"), b"b".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();

        assert_eq!(transport.queue_depth("backlog"), 2);
        assert_eq!(transport.queue_depth("builder"), 1);
        assert!(transport.peek("builder")[0].persistent);
    }

    #[tokio::test]
    async fn declarations_are_idempotent_but_checked() {
        let transport = MemoryTransport::new();
        let channel = bound(&transport, "backlog", "index.crawler").await;
        channel
            .bind_queue(&queue("backlog"), &exchange(), &key("index.crawler"))
            .await
            .unwrap();
        assert_eq!(transport.bindings("index").len(), 1);

        let err = channel
            .declare_exchange(&exchange(), ExchangeKind::Direct, true)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed { .. }));
        let err = channel.declare_queue(&queue("backlog"), false).await.unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn publish_to_missing_exchange_fails() {
        let transport = MemoryTransport::new();
        let channel = channel(&transport).await;
        let err = channel
            .publish(&exchange(), &key("x"), Vec::new(), DeliveryMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ExchangeNotFound("index".into()));
    }

    #[tokio::test]
    async fn prefetch_limits_unsettled_deliveries() {
        let transport = MemoryTransport::new();
        let channel = bound(&transport, "backlog", "index.#").await;
        for body in [b"1", b"2"] {
            channel
                .publish(&exchange(), &key("index.a"), body.to_vec(), DeliveryMode::Persistent)
                .await
                .unwrap();
        }
        channel.set_prefetch(1).await.unwrap();
        let mut consumer = channel.consume(&queue("backlog")).await.unwrap();

        let first = consumer.next().await.unwrap();
        assert_eq!(first.body, b"1");
        let blocked = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let second = consumer.next().await.unwrap();
        assert_eq!(second.body, b"2");
        second.reject(false).await.unwrap();
        assert_eq!(transport.rejected("backlog"), 1);
        assert_eq!(transport.queue_depth("backlog"), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let transport = MemoryTransport::new();
        let channel = bound(&transport, "backlog", "index.#").await;
        channel
            .publish(&exchange(), &key("index.a"), b"x".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();
        channel.set_prefetch(1).await.unwrap();

        let mut consumer = channel.consume(&queue("backlog")).await.unwrap();
        let delivery = consumer.next().await.unwrap();
        drop(delivery);
        drop(consumer);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = transport.peek("backlog");
        assert_eq!(queued.len(), 1);
        assert!(queued[0].redelivered);
    }
}
