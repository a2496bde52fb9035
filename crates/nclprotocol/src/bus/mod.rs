//! Message bus abstraction.
//!
//! The transport needs subject-addressed publish/subscribe with per-subject
//! FIFO ordering and request/reply. [`NatsClientFactory`] provides that over
//! NATS; [`MemoryBus`] provides it in-process.

mod memory;
mod nats;

pub use memory::{MemoryBus, MemoryConnection};
pub use nats::{NatsClient, NatsClientFactory};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A raw message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Stream of messages for one subscription. Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, BusMessage>;

/// A connection to the bus.
#[async_trait]
pub trait BusClient: Send + Sync + fmt::Debug {
    async fn publish(&self, message: BusMessage) -> Result<()>;

    /// Publish with a private reply subject and wait for the first reply.
    async fn request(&self, message: BusMessage, timeout: Duration) -> Result<BusMessage>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Unique subject suitable for replies.
    fn new_inbox(&self) -> String;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Opens bus connections.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create_client(&self) -> Result<Arc<dyn BusClient>>;
}

/// Match a subject against a NATS-style pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (p, Some(s)) if p == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}
