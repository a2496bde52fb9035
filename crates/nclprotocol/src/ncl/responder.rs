use crate::bus::{BusClient, BusMessage};
use crate::envelope::Message;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Answers one type of request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Message) -> Result<Message>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Message>> + Send,
{
    async fn handle_request(&self, request: Message) -> Result<Message> {
        self(request).await
    }
}

type Handlers = DashMap<String, Arc<dyn RequestHandler>>;

/// Serves requests on a subject, dispatching on message type.
///
/// Each request is handled on its own task; handler errors are sent back as
/// error envelopes.
pub struct Responder {
    client: Arc<dyn BusClient>,
    name: String,
    subject: String,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Responder {
    pub fn new(
        client: Arc<dyn BusClient>,
        name: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            subject: subject.into(),
            handlers: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Register the handler for `message_type`, subscribing on first use.
    pub async fn listen(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<()> {
        let message_type = message_type.into();
        if self.handlers.contains_key(&message_type) {
            return Err(Error::InvalidConfig(format!(
                "handler for {message_type} already registered"
            )));
        }
        self.handlers.insert(message_type, handler);

        let mut task = self.task.lock().await;
        if task.is_none() {
            if self.cancel.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }
            let stream = self.client.subscribe(&self.subject).await?;
            *task = Some(tokio::spawn(serve(
                stream,
                self.client.clone(),
                self.handlers.clone(),
                self.name.clone(),
                self.cancel.clone(),
            )));
        }
        Ok(())
    }

    /// Stop serving. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    mut stream: crate::bus::Subscription,
    client: Arc<dyn BusClient>,
    handlers: Arc<Handlers>,
    name: String,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = stream.next() => match request {
                Some(request) => request,
                None => return,
            },
        };
        let Some(reply) = request.reply.clone() else {
            tracing::debug!(responder = %name, subject = %request.subject, "dropping request without reply subject");
            continue;
        };
        let client = client.clone();
        let handlers = handlers.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let response = match respond(&handlers, &request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(responder = %name, subject = %request.subject, error = %e, "request failed");
                    Message::error(&e)
                }
            };
            match response.encode() {
                Ok(payload) => {
                    if let Err(e) = client.publish(BusMessage::new(reply, payload)).await {
                        tracing::warn!(responder = %name, error = %e, "failed to send response");
                    }
                }
                Err(e) => tracing::error!(responder = %name, error = %e, "failed to encode response"),
            }
        });
    }
}

async fn respond(handlers: &Handlers, request: &BusMessage) -> Result<Message> {
    let message = Message::from_bytes(&request.payload)?;
    let message_type = message.message_type().unwrap_or_default().to_string();
    let handler = handlers
        .get(&message_type)
        .map(|h| h.value().clone())
        .ok_or(Error::NoHandler(message_type))?;
    handler.handle_request(message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::messages::{HeartbeatRequest, HeartbeatResponse};
    use crate::models::Resources;
    use crate::ncl::{BusPublisher, Publisher, PublisherConfig};

    #[tokio::test]
    async fn test_dispatches_by_type() {
        let bus = MemoryBus::new();
        let responder = Responder::new(bus.connect().unwrap(), "orchestrator", "svc.*.ctrl");
        let handler: Arc<dyn RequestHandler> = Arc::new(|request: Message| async move {
            let heartbeat: HeartbeatRequest = request.decode()?;
            assert_eq!(heartbeat.node_id, "n1");
            Message::from_payload(&HeartbeatResponse {})
        });
        responder.listen("HeartbeatRequest", handler).await.unwrap();

        let publisher =
            BusPublisher::new(bus.connect().unwrap(), PublisherConfig::new("n1", "svc.n1.ctrl"))
                .unwrap();
        let request = Message::from_payload(&HeartbeatRequest {
            node_id: "n1".into(),
            available_capacity: Resources::default(),
            queue_used_capacity: Resources::default(),
            last_orchestrator_seq_num: 0,
        })
        .unwrap();
        let response = publisher.request(request).await.unwrap();
        assert!(response.decode::<HeartbeatResponse>().is_ok());

        let err = publisher
            .request(Message::new("Unknown", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { ref code, .. } if code == "NoHandler"));

        responder.close().await.unwrap();
        responder.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let bus = MemoryBus::new();
        let responder = Responder::new(bus.connect().unwrap(), "r", "svc");
        let handler: Arc<dyn RequestHandler> =
            Arc::new(|_: Message| async move { Ok::<_, Error>(Message::ack()) });
        responder.listen("A", handler.clone()).await.unwrap();
        assert!(responder.listen("A", handler).await.is_err());
    }
}
