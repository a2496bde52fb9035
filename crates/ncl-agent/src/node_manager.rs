//! In-memory node registry for a standalone orchestrator.

use async_trait::async_trait;
use chrono::Utc;
use nclprotocol::messages::{
    ExtendedHeartbeatRequest, HandshakeRequest, HandshakeResponse, HeartbeatResponse,
    ShutdownNoticeRequest, ShutdownNoticeResponse, UpdateNodeInfoRequest, UpdateNodeInfoResponse,
};
use nclprotocol::models::{NodeInfo, NodeType};
use nclprotocol::orchestrator::{
    NodeConnectionEvent, NodeConnectionHandler, NodeConnectionState, NodeManager,
};
use nclprotocol::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct NodeEntry {
    info: NodeInfo,
    state: NodeConnectionState,
    last_heartbeat: Instant,
    last_compute_seq_num: u64,
    last_orchestrator_seq_num: u64,
}

/// Snapshot of a registered node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub info: NodeInfo,
    pub state: NodeConnectionState,
    pub last_compute_seq_num: u64,
    pub last_orchestrator_seq_num: u64,
}

/// Admits compute nodes and tracks their liveness.
///
/// A node that has not sent a heartbeat within `heartbeat_timeout` is marked
/// disconnected by [`sweep`](Self::sweep); observers are notified of every
/// transition.
pub struct InMemoryNodeManager {
    heartbeat_timeout: Duration,
    nodes: Mutex<HashMap<String, NodeEntry>>,
    handlers: RwLock<Vec<NodeConnectionHandler>>,
}

impl InMemoryNodeManager {
    pub fn new(heartbeat_timeout: Duration) -> Result<Self> {
        if heartbeat_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat timeout must be positive".into(),
            ));
        }
        Ok(Self {
            heartbeat_timeout,
            nodes: Mutex::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn get(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.lock().get(node_id).map(|entry| NodeStatus {
            info: entry.info.clone(),
            state: entry.state,
            last_compute_seq_num: entry.last_compute_seq_num,
            last_orchestrator_seq_num: entry.last_orchestrator_seq_num,
        })
    }

    pub fn connected_count(&self) -> usize {
        self.nodes
            .lock()
            .values()
            .filter(|n| n.state == NodeConnectionState::Connected)
            .count()
    }

    /// Mark nodes with stale heartbeats disconnected. Returns how many were.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = {
            let mut nodes = self.nodes.lock();
            nodes
                .iter_mut()
                .filter(|(_, n)| {
                    n.state == NodeConnectionState::Connected
                        && now.duration_since(n.last_heartbeat) > self.heartbeat_timeout
                })
                .map(|(id, n)| {
                    n.state = NodeConnectionState::Disconnected;
                    id.clone()
                })
                .collect()
        };
        for node_id in &stale {
            tracing::info!(node_id = %node_id, timeout = ?self.heartbeat_timeout, "node missed heartbeats");
            self.notify(node_id, NodeConnectionState::Connected, NodeConnectionState::Disconnected);
        }
        stale.len()
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run_sweep(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let count = self.sweep();
            if count > 0 {
                tracing::info!(count, "marked stale nodes disconnected");
            }
        }
    }

    fn set_state(&self, node_id: &str, state: NodeConnectionState) {
        let previous = {
            let mut nodes = self.nodes.lock();
            match nodes.get_mut(node_id) {
                Some(entry) => std::mem::replace(&mut entry.state, state),
                None => return,
            }
        };
        if previous != state {
            self.notify(node_id, previous, state);
        }
    }

    fn notify(&self, node_id: &str, previous: NodeConnectionState, current: NodeConnectionState) {
        let event = NodeConnectionEvent {
            node_id: node_id.to_string(),
            previous,
            current,
            timestamp: Utc::now(),
        };
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn require_connected(&self, node_id: &str) -> Result<()> {
        match self.nodes.lock().get(node_id) {
            Some(entry) if entry.state == NodeConnectionState::Connected => Ok(()),
            _ => Err(Error::HandshakeRequired(node_id.to_string())),
        }
    }
}

#[async_trait]
impl NodeManager for InMemoryNodeManager {
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        let info = request.node_info;
        let node_id = info.node_id.clone();
        if node_id.is_empty() {
            return Ok(HandshakeResponse::rejected("node id is required"));
        }
        if info.node_type != NodeType::Compute {
            return Ok(HandshakeResponse::rejected(format!(
                "node type {:?} cannot join as a compute node",
                info.node_type
            )));
        }

        let last_compute_seq_num = {
            let mut nodes = self.nodes.lock();
            let entry = nodes.entry(node_id.clone()).or_insert_with(|| NodeEntry {
                info: info.clone(),
                state: NodeConnectionState::Disconnected,
                last_heartbeat: Instant::now(),
                last_compute_seq_num: 0,
                last_orchestrator_seq_num: 0,
            });
            entry.info = info;
            entry.last_heartbeat = Instant::now();
            entry.last_orchestrator_seq_num = request.last_orchestrator_seq_num;
            entry.last_compute_seq_num
        };
        self.set_state(&node_id, NodeConnectionState::Connected);

        Ok(HandshakeResponse::accepted(
            request.last_orchestrator_seq_num,
            last_compute_seq_num,
        ))
    }

    async fn heartbeat(&self, request: ExtendedHeartbeatRequest) -> Result<HeartbeatResponse> {
        let node_id = &request.heartbeat.node_id;
        self.require_connected(node_id)?;
        if let Some(entry) = self.nodes.lock().get_mut(node_id) {
            entry.last_heartbeat = Instant::now();
            entry.last_compute_seq_num = request.last_compute_seq_num;
            entry.last_orchestrator_seq_num = request.heartbeat.last_orchestrator_seq_num;
            entry.info.compute_node_info.available_capacity =
                request.heartbeat.available_capacity.clone();
            entry.info.compute_node_info.queue_used_capacity =
                request.heartbeat.queue_used_capacity.clone();
        }
        Ok(HeartbeatResponse {})
    }

    async fn update_node_info(&self, request: UpdateNodeInfoRequest) -> Result<UpdateNodeInfoResponse> {
        let node_id = request.node_info.node_id.clone();
        if self.require_connected(&node_id).is_err() {
            return Ok(UpdateNodeInfoResponse {
                accepted: false,
                reason: format!("node {node_id} is not connected"),
            });
        }
        if let Some(entry) = self.nodes.lock().get_mut(&node_id) {
            entry.info = request.node_info;
        }
        tracing::info!(node_id = %node_id, "node info updated");
        Ok(UpdateNodeInfoResponse {
            accepted: true,
            reason: String::new(),
        })
    }

    async fn shutdown_notice(&self, request: ShutdownNoticeRequest) -> Result<ShutdownNoticeResponse> {
        if let Some(entry) = self.nodes.lock().get_mut(&request.node_id) {
            entry.last_orchestrator_seq_num = request.last_orchestrator_seq_num;
        }
        self.set_state(&request.node_id, NodeConnectionState::Disconnected);
        Ok(ShutdownNoticeResponse {})
    }

    fn on_connection_state_change(&self, handler: NodeConnectionHandler) {
        self.handlers.write().push(handler);
    }
}
