use super::to_bus_message;
use crate::bus::BusClient;
use crate::envelope::{Message, KEY_SOURCE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sends messages to a fixed destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Publish and wait for the reply. Error replies surface as
    /// [`Error::Remote`].
    async fn request(&self, message: Message) -> Result<Message>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Stamped into the `Source` metadata of every message.
    pub name: String,
    pub destination: String,
    pub request_timeout: Duration,
}

impl PublisherConfig {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// [`Publisher`] over a bus connection.
#[derive(Debug)]
pub struct BusPublisher {
    client: Arc<dyn BusClient>,
    config: PublisherConfig,
}

impl BusPublisher {
    pub fn new(client: Arc<dyn BusClient>, config: PublisherConfig) -> Result<Self> {
        if config.destination.is_empty() {
            return Err(Error::InvalidConfig("publisher destination is required".into()));
        }
        if config.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request timeout must be positive".into()));
        }
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Publisher for BusPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        let message = message.with_metadata(KEY_SOURCE, &self.config.name);
        self.client
            .publish(to_bus_message(&self.config.destination, &message)?)
            .await
    }

    async fn request(&self, message: Message) -> Result<Message> {
        let message = message.with_metadata(KEY_SOURCE, &self.config.name);
        let reply = self
            .client
            .request(
                to_bus_message(&self.config.destination, &message)?,
                self.config.request_timeout,
            )
            .await?;

        let response = Message::from_bytes(&reply.payload)?;
        match response.as_error() {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }
}
