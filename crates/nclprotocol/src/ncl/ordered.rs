//! Ordered publishing with per-message acknowledgement futures.
//!
//! A single task drains the submission queue, so messages reach the bus in
//! the order they were submitted. Each message carries a reply subject under
//! the publisher's inbox; the receiving subscriber answers with an ack or an
//! error envelope, which resolves the message's [`PubFuture`].

use super::to_bus_message;
use crate::bus::{BusClient, BusMessage};
use crate::envelope::{Message, KEY_MESSAGE_ID, KEY_SOURCE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Publisher that preserves submission order and reports delivery asynchronously.
#[async_trait]
pub trait OrderedPublisher: Send + Sync {
    /// Queue a message without waiting for delivery.
    async fn publish_async(&self, message: Message) -> Result<PubFuture>;

    /// Fail every queued and in-flight message with [`Error::PublisherReset`].
    async fn reset(&self);

    /// Stop publishing. Pending messages fail. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Outcome of one ordered publish.
#[derive(Debug)]
pub struct PubFuture {
    message_id: String,
    rx: oneshot::Receiver<Result<()>>,
    acked: bool,
}

impl PubFuture {
    pub fn new(message_id: impl Into<String>, rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            message_id: message_id.into(),
            rx,
            acked: false,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Non-blocking poll. `None` while the outcome is unknown.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        if self.acked {
            return Some(Ok(()));
        }
        match self.rx.try_recv() {
            Ok(Ok(())) => {
                self.acked = true;
                Some(Ok(()))
            }
            Ok(Err(e)) => Some(Err(e)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::PublisherReset)),
        }
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<()> {
        if self.acked {
            return Ok(());
        }
        self.rx.await.unwrap_or(Err(Error::PublisherReset))
    }
}

#[derive(Debug, Clone)]
pub struct OrderedPublisherConfig {
    pub name: String,
    pub destination: String,
    /// How long to wait for an ack before failing the message.
    pub ack_wait: Duration,
    /// Maximum queued plus in-flight messages.
    pub max_pending: usize,
}

impl OrderedPublisherConfig {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            ack_wait: Duration::from_secs(5),
            max_pending: 1024,
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(Error::InvalidConfig("publisher destination is required".into()));
        }
        if self.ack_wait.is_zero() {
            return Err(Error::InvalidConfig("ack wait must be positive".into()));
        }
        if self.max_pending == 0 {
            return Err(Error::InvalidConfig("max pending must be positive".into()));
        }
        Ok(())
    }
}

struct Outgoing {
    id: String,
    message: BusMessage,
    tx: oneshot::Sender<Result<()>>,
}

struct Inflight {
    tx: oneshot::Sender<Result<()>>,
    deadline: Instant,
}

struct Shared {
    client: Arc<dyn BusClient>,
    config: OrderedPublisherConfig,
    inbox: String,
    queue: Mutex<VecDeque<Outgoing>>,
    queued: Notify,
    inflight: DashMap<String, Inflight>,
    // Held while a message moves from the queue onto the bus, so a reset
    // never misses one in transit.
    publish_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn publish_queued(&self) {
        loop {
            let _guard = self.publish_lock.lock().await;
            let Some(outgoing) = self.queue.lock().pop_front() else {
                return;
            };
            self.inflight.insert(
                outgoing.id.clone(),
                Inflight {
                    tx: outgoing.tx,
                    deadline: Instant::now() + self.config.ack_wait,
                },
            );
            if let Err(e) = self.client.publish(outgoing.message).await {
                tracing::warn!(
                    publisher = %self.config.name,
                    message_id = %outgoing.id,
                    error = %e,
                    "failed to publish message"
                );
                self.complete(&outgoing.id, Err(e));
            }
        }
    }

    fn complete(&self, id: &str, result: Result<()>) {
        if let Some((_, inflight)) = self.inflight.remove(id) {
            let _ = inflight.tx.send(result);
        }
    }

    fn handle_reply(&self, reply: BusMessage) {
        let Some(id) = reply.subject.rsplit('.').next() else {
            return;
        };
        let result = match Message::from_bytes(&reply.payload) {
            Ok(message) => match message.as_error() {
                Some(err) => Err(Error::Publish(err.to_string())),
                None => Ok(()),
            },
            Err(e) => Err(e),
        };
        self.complete(id, result);
    }

    fn expire(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            self.complete(&id, Err(Error::AckTimeout(id.clone())));
        }
    }

    async fn fail_all(&self, error: impl Fn() -> Error) {
        let _guard = self.publish_lock.lock().await;
        let queued: Vec<Outgoing> = self.queue.lock().drain(..).collect();
        for outgoing in queued {
            let _ = outgoing.tx.send(Err(error()));
        }
        let ids: Vec<String> = self.inflight.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.complete(&id, Err(error()));
        }
    }

    fn pending(&self) -> usize {
        self.queue.lock().len() + self.inflight.len()
    }
}

/// [`OrderedPublisher`] over a bus connection.
pub struct OrderedBusPublisher {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl OrderedBusPublisher {
    pub async fn new(client: Arc<dyn BusClient>, config: OrderedPublisherConfig) -> Result<Self> {
        config.validate()?;

        let inbox = client.new_inbox();
        let mut replies = client.subscribe(&format!("{inbox}.*")).await?;
        let shared = Arc::new(Shared {
            client,
            config,
            inbox,
            queue: Mutex::new(VecDeque::new()),
            queued: Notify::new(),
            inflight: DashMap::new(),
            publish_lock: tokio::sync::Mutex::new(()),
        });
        let cancel = CancellationToken::new();

        let publish_task = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = shared.queued.notified() => shared.publish_queued().await,
                    }
                }
            })
        };

        let reply_task = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        reply = replies.next() => match reply {
                            Some(reply) => shared.handle_reply(reply),
                            None => return,
                        },
                    }
                }
            })
        };

        let expiry_task = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            let period = (shared.config.ack_wait / 4).max(Duration::from_millis(10));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => shared.expire(),
                    }
                }
            })
        };

        Ok(Self {
            shared,
            cancel,
            tasks: Mutex::new(vec![publish_task, reply_task, expiry_task]),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of queued plus in-flight messages.
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }
}

#[async_trait]
impl OrderedPublisher for OrderedBusPublisher {
    async fn publish_async(&self, message: Message) -> Result<PubFuture> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Publish("publisher closed".into()));
        }
        if self.shared.pending() >= self.shared.config.max_pending {
            return Err(Error::Publish(format!(
                "too many pending messages ({})",
                self.shared.config.max_pending
            )));
        }

        let id = message
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let message = message
            .with_metadata(KEY_MESSAGE_ID, &id)
            .with_metadata(KEY_SOURCE, &self.shared.config.name);
        let bus_message = to_bus_message(&self.shared.config.destination, &message)?
            .with_reply(format!("{}.{}", self.shared.inbox, id));

        let (tx, rx) = oneshot::channel();
        self.shared.queue.lock().push_back(Outgoing {
            id: id.clone(),
            message: bus_message,
            tx,
        });
        self.shared.queued.notify_one();
        Ok(PubFuture::new(id, rx))
    }

    async fn reset(&self) {
        self.shared.fail_all(|| Error::PublisherReset).await;
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.shared
            .fail_all(|| Error::Publish("publisher closed".into()))
            .await;
        Ok(())
    }
}

impl Drop for OrderedBusPublisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    /// Acks every message on `subject`, or nacks when `nack` is set.
    async fn spawn_acker(bus: &MemoryBus, subject: &str, nack: bool) -> Arc<crate::bus::MemoryConnection> {
        let conn = bus.connect().unwrap();
        let mut sub = conn.subscribe(subject).await.unwrap();
        let responder = conn.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let reply = if nack {
                    Message::error(&Error::Publish("handler failed".into()))
                } else {
                    Message::ack()
                };
                let _ = responder
                    .publish(BusMessage::new(msg.reply.unwrap(), reply.encode().unwrap()))
                    .await;
            }
        });
        conn
    }

    fn message(seq: u64) -> Message {
        Message::new("ExecutionUpsert", serde_json::json!({ "seq": seq }))
    }

    #[tokio::test]
    async fn test_acks_resolve_futures_in_order() {
        let bus = MemoryBus::new();
        let _acker = spawn_acker(&bus, "dest", false).await;
        let observer = bus.connect().unwrap();
        let mut observed = observer.subscribe("dest").await.unwrap();

        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("test", "dest"),
        )
        .await
        .unwrap();

        let mut futures = Vec::new();
        for seq in 1..=5 {
            futures.push(publisher.publish_async(message(seq)).await.unwrap());
        }
        for future in futures {
            future.wait().await.unwrap();
        }
        for seq in 1..=5u64 {
            let msg = Message::from_bytes(&observed.next().await.unwrap().payload).unwrap();
            assert_eq!(msg.payload["seq"], seq);
        }
        assert_eq!(publisher.pending(), 0);
        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_fails_future() {
        let bus = MemoryBus::new();
        let _acker = spawn_acker(&bus, "dest", true).await;
        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("test", "dest"),
        )
        .await
        .unwrap();

        let future = publisher.publish_async(message(1)).await.unwrap();
        assert!(matches!(future.wait().await, Err(Error::Publish(_))));
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let bus = MemoryBus::new();
        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("test", "nobody").with_ack_wait(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        let future = publisher.publish_async(message(1)).await.unwrap();
        assert!(matches!(future.wait().await, Err(Error::AckTimeout(_))));
    }

    #[tokio::test]
    async fn test_reset_fails_pending() {
        let bus = MemoryBus::new();
        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("test", "nobody"),
        )
        .await
        .unwrap();

        let mut future = publisher.publish_async(message(1)).await.unwrap();
        publisher.reset().await;
        assert!(matches!(future.try_result(), Some(Err(Error::PublisherReset))));
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn test_max_pending_and_close() {
        let bus = MemoryBus::new();
        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("test", "nobody").with_max_pending(2),
        )
        .await
        .unwrap();

        let _a = publisher.publish_async(message(1)).await.unwrap();
        let _b = publisher.publish_async(message(2)).await.unwrap();
        assert!(publisher.publish_async(message(3)).await.is_err());

        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        assert!(publisher.publish_async(message(4)).await.is_err());
    }
}
