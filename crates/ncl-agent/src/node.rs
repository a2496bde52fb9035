//! Stand-in collaborators used when the agent runs without a scheduler.

use async_trait::async_trait;
use nclprotocol::logstream::{LogEntry, LogStreamRequest, LogStreamServer};
use nclprotocol::models::NodeInfo;
use nclprotocol::ncl::MessageHandler;
use nclprotocol::watcher::{Event, EVENT_OBJECT_EXECUTION_UPSERT};
use nclprotocol::{
    Error, Message, MessageCreator, MessageCreatorFactory, NodeInfoProvider, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Parse `key=value` labels.
pub fn parse_labels(labels: &[String]) -> Result<BTreeMap<String, String>> {
    labels
        .iter()
        .map(|label| match label.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(Error::InvalidConfig(format!(
                "invalid label {label:?}, expected key=value"
            ))),
        })
        .collect()
}

/// Reports the same node description on every call.
pub struct StaticNodeInfoProvider {
    info: NodeInfo,
}

impl StaticNodeInfoProvider {
    pub fn new(info: NodeInfo) -> Self {
        Self { info }
    }
}

impl NodeInfoProvider for StaticNodeInfoProvider {
    fn get_node_info(&self) -> NodeInfo {
        self.info.clone()
    }
}

/// Logs inbound data messages.
pub struct LoggingMessageHandler {
    side: &'static str,
}

impl LoggingMessageHandler {
    pub fn new(side: &'static str) -> Self {
        Self { side }
    }
}

#[async_trait]
impl MessageHandler for LoggingMessageHandler {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        tracing::info!(
            side = self.side,
            message_type = message.message_type().unwrap_or_default(),
            seq_num = message.seq_num().unwrap_or_default(),
            source = message.metadata_value(nclprotocol::envelope::KEY_SOURCE).unwrap_or_default(),
            "received message"
        );
        Ok(())
    }
}

/// Forwards execution upsert events unchanged.
///
/// When scoped to a node, only events whose `node_id` field names that node
/// are forwarded.
#[derive(Debug, Clone, Default)]
pub struct PassthroughMessageCreator {
    node_id: Option<String>,
}

impl PassthroughMessageCreator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageCreator for PassthroughMessageCreator {
    fn create_message(&self, event: &Event) -> Result<Option<Message>> {
        if event.object_type != EVENT_OBJECT_EXECUTION_UPSERT {
            return Ok(None);
        }
        if let Some(node_id) = &self.node_id {
            let target = event.object.get("node_id").and_then(|v| v.as_str());
            if target != Some(node_id.as_str()) {
                return Ok(None);
            }
        }
        Ok(Some(Message::new(
            EVENT_OBJECT_EXECUTION_UPSERT,
            event.object.clone(),
        )))
    }
}

#[async_trait]
impl MessageCreatorFactory for PassthroughMessageCreator {
    async fn create_message_creator(&self, node_id: &str) -> Result<Arc<dyn MessageCreator>> {
        Ok(Arc::new(PassthroughMessageCreator {
            node_id: Some(node_id.to_string()),
        }))
    }
}

/// Answers every log request with an empty stream.
pub struct NoopLogStreamServer;

#[async_trait]
impl LogStreamServer for NoopLogStreamServer {
    async fn get_log_stream(&self, request: LogStreamRequest) -> Result<mpsc::Receiver<LogEntry>> {
        tracing::debug!(execution_id = %request.execution_id, "no logs available");
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}
