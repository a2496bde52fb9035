//! Execution log streaming served by compute nodes.
//!
//! A client sends a [`LogStreamRequest`] with a reply subject to the node's
//! `in.requests` subject. The node answers with a series of [`LogEntry`]
//! messages on that reply subject, terminated by [`LogStreamEnd`], or with a
//! single error envelope when the stream cannot be opened.

use crate::bus::{BusClient, BusMessage, Subscription};
use crate::envelope::Message;
use crate::error::{Error, Result};
use crate::messages::Payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamRequest {
    pub execution_id: String,
    /// Only return the most recent lines.
    #[serde(default)]
    pub tail: bool,
    /// Keep streaming new lines until the execution ends.
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStreamType,
    pub line: String,
}

/// Marks the end of a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamEnd {
    pub execution_id: String,
}

impl Payload for LogStreamRequest {
    const MESSAGE_TYPE: &'static str = "LogStreamRequest";
}

impl Payload for LogEntry {
    const MESSAGE_TYPE: &'static str = "LogEntry";
}

impl Payload for LogStreamEnd {
    const MESSAGE_TYPE: &'static str = "LogStreamEnd";
}

/// Source of execution logs on the compute node.
#[async_trait]
pub trait LogStreamServer: Send + Sync {
    /// Open a stream of log entries. The stream ends when the sender is dropped.
    async fn get_log_stream(&self, request: LogStreamRequest) -> Result<mpsc::Receiver<LogEntry>>;
}

/// Serves [`LogStreamRequest`]s on one subject.
pub struct LogStreamHandler {
    client: Arc<dyn BusClient>,
    server: Arc<dyn LogStreamServer>,
    subject: String,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LogStreamHandler {
    pub fn new(
        client: Arc<dyn BusClient>,
        server: Arc<dyn LogStreamServer>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            client,
            server,
            subject: subject.into(),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        if self.task.lock().is_some() {
            return Err(Error::AlreadyRunning("log stream handler"));
        }
        let stream = self.client.subscribe(&self.subject).await?;
        let task = tokio::spawn(serve(
            stream,
            self.client.clone(),
            self.server.clone(),
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
        tracing::debug!(subject = %self.subject, "log stream handler started");
        Ok(())
    }

    /// Stop serving and abandon open streams. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for LogStreamHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    mut stream: Subscription,
    client: Arc<dyn BusClient>,
    server: Arc<dyn LogStreamServer>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.next() => match message {
                Some(message) => message,
                None => return,
            },
        };
        let Some(reply) = message.reply.clone() else {
            tracing::debug!(subject = %message.subject, "ignoring log stream request without reply subject");
            continue;
        };
        tokio::spawn(stream_logs(
            message,
            reply,
            client.clone(),
            server.clone(),
            cancel.child_token(),
        ));
    }
}

async fn stream_logs(
    message: BusMessage,
    reply: String,
    client: Arc<dyn BusClient>,
    server: Arc<dyn LogStreamServer>,
    cancel: CancellationToken,
) {
    let opened = async {
        let request: LogStreamRequest = Message::from_bytes(&message.payload)?.decode()?;
        let execution_id = request.execution_id.clone();
        let entries = server.get_log_stream(request).await?;
        Ok::<_, Error>((execution_id, entries))
    }
    .await;

    let (execution_id, mut entries) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open log stream");
            send(client.as_ref(), &reply, Message::error(&e)).await;
            return;
        }
    };

    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => return,
            entry = entries.recv() => entry,
        };
        let Some(entry) = entry else { break };
        match Message::from_payload(&entry) {
            Ok(message) => {
                if !send(client.as_ref(), &reply, message).await {
                    return;
                }
            }
            Err(e) => tracing::warn!(execution_id = %execution_id, error = %e, "failed to encode log entry"),
        }
    }

    match Message::from_payload(&LogStreamEnd { execution_id }) {
        Ok(end) => {
            send(client.as_ref(), &reply, end).await;
        }
        Err(e) => tracing::warn!(error = %e, "failed to encode end of log stream"),
    }
}

async fn send(client: &dyn BusClient, subject: &str, message: Message) -> bool {
    let result = match message.encode() {
        Ok(payload) => client.publish(BusMessage::new(subject, payload)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::debug!(subject = %subject, error = %e, "failed to send log stream message");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    struct FixedLogs(Vec<&'static str>);

    #[async_trait]
    impl LogStreamServer for FixedLogs {
        async fn get_log_stream(&self, request: LogStreamRequest) -> Result<mpsc::Receiver<LogEntry>> {
            if request.execution_id == "missing" {
                return Err(Error::EventStore("execution missing not found".into()));
            }
            let (tx, rx) = mpsc::channel(8);
            let lines = self.0.clone();
            tokio::spawn(async move {
                for line in lines {
                    let entry = LogEntry {
                        timestamp: Utc::now(),
                        stream: LogStreamType::Stdout,
                        line: line.to_string(),
                    };
                    if tx.send(entry).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    async fn request(bus: &MemoryBus, execution_id: &str) -> Vec<Message> {
        let client = bus.connect().unwrap();
        let inbox = client.new_inbox();
        let mut replies = client.subscribe(&inbox).await.unwrap();
        let request = Message::from_payload(&LogStreamRequest {
            execution_id: execution_id.into(),
            tail: false,
            follow: false,
        })
        .unwrap();
        client
            .publish(BusMessage::new("logs", request.encode().unwrap()).with_reply(inbox))
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(reply) = replies.next().await {
            let message = Message::from_bytes(&reply.payload).unwrap();
            let done = message.is_error() || message.message_type() == Some(LogStreamEnd::MESSAGE_TYPE);
            received.push(message);
            if done {
                break;
            }
        }
        received
    }

    #[tokio::test]
    async fn test_streams_entries_then_end() {
        let bus = MemoryBus::new();
        let handler = LogStreamHandler::new(
            bus.connect().unwrap(),
            Arc::new(FixedLogs(vec!["starting", "done"])),
            "logs",
        );
        handler.start().await.unwrap();

        let received = request(&bus, "e-1").await;
        assert_eq!(received.len(), 3);
        let first: LogEntry = received[0].decode().unwrap();
        assert_eq!(first.line, "starting");
        let end: LogStreamEnd = received[2].decode().unwrap();
        assert_eq!(end.execution_id, "e-1");

        handler.close().await.unwrap();
        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_replied() {
        let bus = MemoryBus::new();
        let handler = LogStreamHandler::new(bus.connect().unwrap(), Arc::new(FixedLogs(vec![])), "logs");
        handler.start().await.unwrap();
        assert!(handler.start().await.is_err());

        let received = request(&bus, "missing").await;
        assert_eq!(received.len(), 1);
        assert!(received[0].as_error().unwrap().to_string().contains("missing"));
    }
}
