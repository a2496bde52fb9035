//! NATS binding for the bus.

use super::{BusClient, BusMessage, ClientFactory, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Opens a fresh NATS connection per connect attempt.
///
/// The compute side calls [`ClientFactory::create_client`] on every
/// reconnect, so a broken connection is never reused.
#[derive(Debug, Clone)]
pub struct NatsClientFactory {
    /// Server URL, e.g. `nats://127.0.0.1:4222`.
    url: String,
    /// Connection name reported to the server.
    name: String,
}

impl NatsClientFactory {
    /// Factory for connections to `url` that identify themselves as `name`.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl ClientFactory for NatsClientFactory {
    async fn create_client(&self) -> Result<Arc<dyn BusClient>> {
        let client = async_nats::ConnectOptions::new()
            .name(&self.name)
            .connect(&self.url)
            .await
            .map_err(|e| Error::Bus(format!("failed to connect to {}: {}", self.url, e)))?;

        tracing::info!(url = %self.url, name = %self.name, "established NATS connection");

        Ok(Arc::new(NatsClient::new(client)))
    }
}

/// [`BusClient`] over an `async_nats::Client`.
///
/// Requests subscribe to a private inbox before publishing, so a reply can
/// never race the subscription. A NATS "no responders" status becomes a
/// [`Error::Bus`] error.
#[derive(Debug)]
pub struct NatsClient {
    client: async_nats::Client,
    closed: AtomicBool,
}

impl NatsClient {
    /// Wrap an already connected client.
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    fn header_map(headers: &BTreeMap<String, String>) -> async_nats::HeaderMap {
        let mut header_map = async_nats::HeaderMap::new();
        for (k, v) in headers {
            header_map.insert(k.as_str(), v.as_str());
        }
        header_map
    }

    fn convert(message: async_nats::Message) -> BusMessage {
        let mut headers = BTreeMap::new();
        if let Some(map) = &message.headers {
            for (name, values) in map.iter() {
                if let Some(value) = values.first() {
                    headers.insert(name.to_string(), value.as_str().to_string());
                }
            }
        }
        BusMessage {
            subject: message.subject.to_string(),
            reply: message.reply.map(|r| r.to_string()),
            headers,
            payload: message.payload,
        }
    }
}

#[async_trait]
impl BusClient for NatsClient {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let headers = Self::header_map(&message.headers);
        let result = match message.reply {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(message.subject, reply, headers, message.payload)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(message.subject, headers, message.payload)
                    .await
            }
        };
        result.map_err(|e| Error::Bus(e.to_string()))
    }

    async fn request(&self, message: BusMessage, timeout: Duration) -> Result<BusMessage> {
        let inbox = self.new_inbox();
        let mut replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;

        let subject = message.subject.clone();
        self.publish(message.with_reply(inbox)).await?;

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => {
                if reply.status == Some(async_nats::StatusCode::NO_RESPONDERS) {
                    return Err(Error::Bus(format!("no responders on {subject}")));
                }
                Ok(Self::convert(reply))
            }
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(subscriber.map(Self::convert).boxed())
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    /// Closed by us, or the underlying connection is down.
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.client.connection_state() == async_nats::connection::State::Disconnected
    }

    /// Drain in-flight messages and close. Closing twice is a no-op.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.drain().await {
            tracing::warn!(error = %e, "failed to drain NATS connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_refused() {
        let factory = NatsClientFactory::new("nats://127.0.0.1:19999", "test");
        let err = factory.create_client().await.unwrap_err();
        assert!(matches!(err, Error::Bus(_)));
    }

    #[test]
    fn test_header_map() {
        let headers = BTreeMap::from([("Type".to_string(), "HeartbeatRequest".to_string())]);
        let map = NatsClient::header_map(&headers);
        assert_eq!(
            map.get("Type").map(|v| v.as_str().to_string()),
            Some("HeartbeatRequest".to_string())
        );
    }
}
