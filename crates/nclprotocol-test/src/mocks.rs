//! Mock capabilities with recording and fault injection.

use async_trait::async_trait;
use chrono::Utc;
use nclprotocol::logstream::{LogEntry, LogStreamRequest, LogStreamServer, LogStreamType};
use nclprotocol::messages::{
    ExtendedHeartbeatRequest, HandshakeRequest, HandshakeResponse, HeartbeatResponse,
    ShutdownNoticeRequest, ShutdownNoticeResponse, UpdateNodeInfoRequest, UpdateNodeInfoResponse,
};
use nclprotocol::ncl::MessageHandler;
use nclprotocol::orchestrator::{
    NodeConnectionEvent, NodeConnectionHandler, NodeConnectionState, NodeManager,
};
use nclprotocol::watcher::{Event, EVENT_OBJECT_EXECUTION_UPSERT};
use nclprotocol::{
    Checkpointer, Error, Message, MessageCreator, MessageCreatorFactory, NodeInfo,
    NodeInfoProvider, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message type of data messages produced by [`MockMessageCreator`].
pub const EXECUTION_UPSERT_MESSAGE: &str = "ExecutionUpsert";

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MockCheckpointer {
    values: Mutex<HashMap<String, u64>>,
    fail: AtomicBool,
}

impl MockCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(self, name: &str, seq_num: u64) -> Self {
        self.values.lock().insert(name.to_string(), seq_num);
        self
    }

    /// Make every subsequent write fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.lock().get(name).copied()
    }
}

#[async_trait]
impl Checkpointer for MockCheckpointer {
    async fn checkpoint(&self, name: &str, seq_num: u64) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Checkpoint(format!("write of {name} refused")));
        }
        self.values.lock().insert(name.to_string(), seq_num);
        Ok(())
    }

    async fn get_checkpoint(&self, name: &str) -> Result<u64> {
        Ok(self.get(name).unwrap_or(0))
    }
}

/// Node info that tests can change between calls.
#[derive(Debug)]
pub struct MockNodeInfoProvider {
    info: RwLock<NodeInfo>,
}

impl MockNodeInfoProvider {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            info: RwLock::new(NodeInfo {
                node_id: node_id.into(),
                ..Default::default()
            }),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut NodeInfo)) {
        f(&mut self.info.write());
    }
}

impl NodeInfoProvider for MockNodeInfoProvider {
    fn get_node_info(&self) -> NodeInfo {
        self.info.read().clone()
    }
}

/// Records every handled message.
#[derive(Debug, Default)]
pub struct MockMessageHandler {
    messages: Mutex<Vec<Message>>,
}

impl MockMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence numbers of the handled messages, in arrival order.
    pub fn seq_nums(&self) -> Vec<u64> {
        self.messages
            .lock()
            .iter()
            .filter_map(Message::seq_num)
            .collect()
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    async fn handle_message(&self, message: &Message) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// Turns execution events into data messages.
///
/// Scoped to a node, it only forwards events whose `node_id` field matches.
#[derive(Debug, Clone, Default)]
pub struct MockMessageCreator {
    node_id: Option<String>,
}

impl MockMessageCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
        }
    }
}

impl MessageCreator for MockMessageCreator {
    fn create_message(&self, event: &Event) -> Result<Option<Message>> {
        if event.object_type != EVENT_OBJECT_EXECUTION_UPSERT {
            return Ok(None);
        }
        if let Some(node_id) = &self.node_id {
            if event.object.get("node_id").and_then(|v| v.as_str()) != Some(node_id.as_str()) {
                return Ok(None);
            }
        }
        Ok(Some(Message::new(
            EXECUTION_UPSERT_MESSAGE,
            event.object.clone(),
        )))
    }
}

#[async_trait]
impl MessageCreatorFactory for MockMessageCreator {
    async fn create_message_creator(&self, node_id: &str) -> Result<Arc<dyn MessageCreator>> {
        Ok(Arc::new(MockMessageCreator::for_node(node_id)))
    }
}

/// Serves a fixed set of stdout lines for any execution.
#[derive(Debug, Default)]
pub struct MockLogStreamServer {
    lines: Vec<String>,
}

impl MockLogStreamServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl LogStreamServer for MockLogStreamServer {
    async fn get_log_stream(&self, request: LogStreamRequest) -> Result<mpsc::Receiver<LogEntry>> {
        if request.execution_id.is_empty() {
            return Err(Error::InvalidConfig("execution id is required".into()));
        }
        let (tx, rx) = mpsc::channel(self.lines.len().max(1));
        for line in &self.lines {
            let entry = LogEntry {
                timestamp: Utc::now(),
                stream: LogStreamType::Stdout,
                line: line.clone(),
            };
            if tx.try_send(entry).is_err() {
                break;
            }
        }
        Ok(rx)
    }
}

#[derive(Debug, Clone, Default)]
struct NodeRecord {
    connected: bool,
    last_compute_seq_num: u64,
}

/// Node manager that admits every node unless told otherwise and records all
/// control traffic.
#[derive(Default)]
pub struct MockNodeManager {
    nodes: Mutex<HashMap<String, NodeRecord>>,
    reject_reason: Mutex<Option<String>>,
    starting_seq_num: Mutex<Option<u64>>,
    require_handshake: AtomicBool,
    reject_node_info: AtomicBool,
    handshakes: Mutex<Vec<HandshakeRequest>>,
    heartbeats: Mutex<Vec<ExtendedHeartbeatRequest>>,
    node_info_updates: Mutex<Vec<UpdateNodeInfoRequest>>,
    shutdown_notices: Mutex<Vec<ShutdownNoticeRequest>>,
    handlers: Mutex<Vec<NodeConnectionHandler>>,
}

impl MockNodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject handshakes with `reason`, or accept again with `None`.
    pub fn set_reject(&self, reason: Option<&str>) {
        *self.reject_reason.lock() = reason.map(str::to_string);
    }

    /// Answer accepted handshakes with this starting sequence number instead
    /// of echoing the node's.
    pub fn set_starting_seq_num(&self, seq_num: Option<u64>) {
        *self.starting_seq_num.lock() = seq_num;
    }

    /// Fail heartbeats with a handshake-required error.
    pub fn set_require_handshake(&self, require: bool) {
        self.require_handshake.store(require, Ordering::SeqCst);
    }

    pub fn set_reject_node_info(&self, reject: bool) {
        self.reject_node_info.store(reject, Ordering::SeqCst);
    }

    /// Mark `node_id` disconnected and notify observers.
    pub fn disconnect(&self, node_id: &str) {
        let was_connected = self
            .nodes
            .lock()
            .get_mut(node_id)
            .map(|n| std::mem::replace(&mut n.connected, false))
            .unwrap_or(false);
        if was_connected {
            self.notify(node_id, NodeConnectionState::Connected, NodeConnectionState::Disconnected);
        }
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.nodes.lock().get(node_id).is_some_and(|n| n.connected)
    }

    pub fn handshakes(&self) -> Vec<HandshakeRequest> {
        self.handshakes.lock().clone()
    }

    pub fn heartbeats(&self) -> Vec<ExtendedHeartbeatRequest> {
        self.heartbeats.lock().clone()
    }

    pub fn node_info_updates(&self) -> Vec<UpdateNodeInfoRequest> {
        self.node_info_updates.lock().clone()
    }

    pub fn shutdown_notices(&self) -> Vec<ShutdownNoticeRequest> {
        self.shutdown_notices.lock().clone()
    }

    fn notify(&self, node_id: &str, previous: NodeConnectionState, current: NodeConnectionState) {
        let event = NodeConnectionEvent {
            node_id: node_id.to_string(),
            previous,
            current,
            timestamp: Utc::now(),
        };
        let handlers: Vec<_> = self.handlers.lock().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

#[async_trait]
impl NodeManager for MockNodeManager {
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        let node_id = request.node_info.node_id.clone();
        let starting =
            (*self.starting_seq_num.lock()).unwrap_or(request.last_orchestrator_seq_num);
        self.handshakes.lock().push(request);

        if let Some(reason) = self.reject_reason.lock().clone() {
            return Ok(HandshakeResponse::rejected(reason));
        }

        let (was_connected, last_compute_seq_num) = {
            let mut nodes = self.nodes.lock();
            let record = nodes.entry(node_id.clone()).or_default();
            let was_connected = std::mem::replace(&mut record.connected, true);
            (was_connected, record.last_compute_seq_num)
        };
        if !was_connected {
            self.notify(&node_id, NodeConnectionState::Disconnected, NodeConnectionState::Connected);
        }
        Ok(HandshakeResponse::accepted(starting, last_compute_seq_num))
    }

    async fn heartbeat(&self, request: ExtendedHeartbeatRequest) -> Result<HeartbeatResponse> {
        let node_id = request.heartbeat.node_id.clone();
        if self.require_handshake.load(Ordering::SeqCst) {
            return Err(Error::HandshakeRequired(node_id));
        }
        if let Some(record) = self.nodes.lock().get_mut(&node_id) {
            record.last_compute_seq_num = request.last_compute_seq_num;
        }
        self.heartbeats.lock().push(request);
        Ok(HeartbeatResponse {})
    }

    async fn update_node_info(&self, request: UpdateNodeInfoRequest) -> Result<UpdateNodeInfoResponse> {
        self.node_info_updates.lock().push(request);
        if self.reject_node_info.load(Ordering::SeqCst) {
            return Ok(UpdateNodeInfoResponse {
                accepted: false,
                reason: "node info rejected".into(),
            });
        }
        Ok(UpdateNodeInfoResponse {
            accepted: true,
            reason: String::new(),
        })
    }

    async fn shutdown_notice(&self, request: ShutdownNoticeRequest) -> Result<ShutdownNoticeResponse> {
        let node_id = request.node_id.clone();
        self.shutdown_notices.lock().push(request);
        self.disconnect(&node_id);
        Ok(ShutdownNoticeResponse {})
    }

    fn on_connection_state_change(&self, handler: NodeConnectionHandler) {
        self.handlers.lock().push(handler);
    }
}
