use super::{MessageHandler, ProcessingNotifier};
use crate::bus::{BusClient, BusMessage};
use crate::envelope::Message;
use crate::error::{Error, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct SubscriberConfig {
    /// Used in logs only.
    pub name: String,
    pub handler: Arc<dyn MessageHandler>,
    pub notifier: Option<Arc<dyn ProcessingNotifier>>,
}

impl SubscriberConfig {
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ProcessingNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

/// Consumes envelopes from one or more subjects in arrival order.
///
/// Messages carrying a reply subject are answered with an ack after
/// successful handling and with an error envelope otherwise.
pub struct Subscriber {
    client: Arc<dyn BusClient>,
    config: SubscriberConfig,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(client: Arc<dyn BusClient>, config: SubscriberConfig) -> Self {
        Self {
            client,
            config,
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, subject: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut stream = self.client.subscribe(subject).await?;
        let client = self.client.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let subject = subject.to_string();

        tracing::debug!(subscriber = %config.name, subject = %subject, "subscribed");

        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = stream.next() => match message {
                        Some(message) => message,
                        None => {
                            tracing::debug!(subscriber = %config.name, subject = %subject, "subscription ended");
                            return;
                        }
                    },
                };
                process(client.as_ref(), &config, message).await;
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Stop consuming. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn process(client: &dyn BusClient, config: &SubscriberConfig, bus_message: BusMessage) {
    let result = match Message::from_bytes(&bus_message.payload) {
        Ok(message) => handle(config, &message).await,
        Err(e) => {
            tracing::warn!(subscriber = %config.name, subject = %bus_message.subject, error = %e, "failed to decode message");
            Err(e)
        }
    };

    let Some(reply) = bus_message.reply else {
        return;
    };
    let response = match &result {
        Ok(()) => Message::ack(),
        Err(e) => Message::error(e),
    };
    let payload = match response.encode() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(subscriber = %config.name, error = %e, "failed to encode reply");
            return;
        }
    };
    if let Err(e) = client.publish(BusMessage::new(reply, payload)).await {
        tracing::warn!(subscriber = %config.name, error = %e, "failed to send reply");
    }
}

async fn handle(config: &SubscriberConfig, message: &Message) -> Result<()> {
    if !config.handler.should_process(message) {
        return Ok(());
    }
    if let Err(e) = config.handler.handle_message(message).await {
        tracing::warn!(
            subscriber = %config.name,
            message_type = message.message_type().unwrap_or_default(),
            seq_num = message.seq_num(),
            error = %e,
            "failed to handle message"
        );
        return Err(e);
    }
    if let Some(notifier) = &config.notifier {
        notifier.on_processed(message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::envelope::KEY_SEQ_NUM;
    use crate::ncl::{OrderedBusPublisher, OrderedPublisher, OrderedPublisherConfig};
    use crate::seq_tracker::SequenceTracker;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, message: &Message) -> Result<()> {
            let seq = message.seq_num().unwrap_or_default();
            if Some(seq) == self.fail_on {
                return Err(Error::EventStore("rejected".into()));
            }
            self.seen.lock().push(seq);
            Ok(())
        }
    }

    fn message(seq: u64) -> Message {
        Message::new("ExecutionUpsert", serde_json::Value::Null).with_metadata(KEY_SEQ_NUM, seq)
    }

    #[tokio::test]
    async fn test_handles_in_order_and_notifies() {
        let bus = MemoryBus::new();
        let recorder = Arc::new(Recorder::default());
        let tracker = Arc::new(SequenceTracker::new());
        let subscriber = Subscriber::new(
            bus.connect().unwrap(),
            SubscriberConfig::new("test", recorder.clone()).with_notifier(tracker.clone()),
        );
        subscriber.subscribe("msgs").await.unwrap();

        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("peer", "msgs"),
        )
        .await
        .unwrap();
        let mut futures = Vec::new();
        for seq in 1..=3 {
            futures.push(publisher.publish_async(message(seq)).await.unwrap());
        }
        for future in futures {
            future.wait().await.unwrap();
        }

        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);
        assert_eq!(tracker.get_last_seq_num(), 3);
        subscriber.close().await.unwrap();
        subscriber.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_nacks_without_notifying() {
        let bus = MemoryBus::new();
        let recorder = Arc::new(Recorder {
            fail_on: Some(2),
            ..Default::default()
        });
        let tracker = Arc::new(SequenceTracker::new());
        let subscriber = Subscriber::new(
            bus.connect().unwrap(),
            SubscriberConfig::new("test", recorder).with_notifier(tracker.clone()),
        );
        subscriber.subscribe("msgs").await.unwrap();

        let publisher = OrderedBusPublisher::new(
            bus.connect().unwrap(),
            OrderedPublisherConfig::new("peer", "msgs"),
        )
        .await
        .unwrap();
        publisher.publish_async(message(1)).await.unwrap().wait().await.unwrap();
        let err = publisher.publish_async(message(2)).await.unwrap().wait().await;
        assert!(err.is_err());
        assert_eq!(tracker.get_last_seq_num(), 1);
    }
}
