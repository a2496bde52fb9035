//! In-process bus for tests and single-binary deployments.

use super::{subject_matches, BusClient, BusMessage, ClientFactory, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Route {
    owner: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Debug, Default)]
struct Broker {
    routes: Mutex<Vec<Route>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    next_id: AtomicU64,
    refuse_connections: AtomicBool,
}

impl Broker {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver to every matching route. Returns the number of receivers.
    fn deliver(&self, message: &BusMessage) -> usize {
        let mut routes = self.routes.lock();
        let mut delivered = 0;
        routes.retain(|route| {
            if !subject_matches(&route.pattern, &message.subject) {
                return !route.tx.is_closed();
            }
            match route.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }
}

/// Shared in-memory broker. Cloning yields a handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    broker: Arc<Broker>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the broker.
    pub fn connect(&self) -> Result<Arc<MemoryConnection>> {
        if self.broker.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::Bus("connection refused".into()));
        }
        let connection = Arc::new(MemoryConnection {
            id: self.broker.next_id(),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        });
        self.broker
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        Ok(connection)
    }

    /// Make subsequent connection attempts fail, simulating an unreachable server.
    pub fn refuse_connections(&self, refuse: bool) {
        self.broker.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Close every open connection, simulating a server restart.
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self
            .broker
            .connections
            .lock()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for connection in connections {
            connection.close().await;
        }
    }

    /// Number of live subscriptions matching `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.broker
            .routes
            .lock()
            .iter()
            .filter(|r| !r.tx.is_closed() && subject_matches(&r.pattern, subject))
            .count()
    }
}

#[async_trait]
impl ClientFactory for MemoryBus {
    async fn create_client(&self) -> Result<Arc<dyn BusClient>> {
        let connection: Arc<dyn BusClient> = self.connect()?;
        Ok(connection)
    }
}

/// One client connection to a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    broker: Arc<Broker>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BusClient for MemoryConnection {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        self.ensure_open()?;
        self.broker.deliver(&message);
        Ok(())
    }

    async fn request(&self, message: BusMessage, timeout: Duration) -> Result<BusMessage> {
        self.ensure_open()?;
        let inbox = self.new_inbox();
        let mut replies = self.subscribe(&inbox).await?;

        let subject = message.subject.clone();
        if self.broker.deliver(&message.with_reply(inbox)) == 0 {
            return Err(Error::Bus(format!("no responders on {subject}")));
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.routes.lock().push(Route {
            owner: self.id,
            pattern: subject.to_string(),
            tx,
        });
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}.{}", self.id, self.broker.next_id())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.routes.lock().retain(|r| r.owner != self.id);
    }
}
