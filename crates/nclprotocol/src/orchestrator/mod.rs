//! Orchestrator side of the transport.

mod config;
mod data_plane;
mod manager;

pub use config::{Config, Dependencies};
pub use data_plane::{dispatcher_id, DataPlane, DataPlaneConfig};
pub use manager::ComputeManager;

use crate::error::Result;
use crate::messages::{
    ExtendedHeartbeatRequest, HandshakeRequest, HandshakeResponse, HeartbeatResponse,
    ShutdownNoticeRequest, ShutdownNoticeResponse, UpdateNodeInfoRequest,
    UpdateNodeInfoResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Liveness of a node as seen by the node manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeConnectionState {
    Connected,
    Disconnected,
}

impl fmt::Display for NodeConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeConnectionState::Connected => f.write_str("Connected"),
            NodeConnectionState::Disconnected => f.write_str("Disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConnectionEvent {
    pub node_id: String,
    pub previous: NodeConnectionState,
    pub current: NodeConnectionState,
    pub timestamp: DateTime<Utc>,
}

pub type NodeConnectionHandler = Arc<dyn Fn(NodeConnectionEvent) + Send + Sync>;

/// Node admission and liveness policy.
#[async_trait]
pub trait NodeManager: Send + Sync {
    /// Accept or reject a node. An accepted response carries the sequence
    /// numbers both sides resume from.
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse>;

    async fn heartbeat(&self, request: ExtendedHeartbeatRequest) -> Result<HeartbeatResponse>;

    async fn update_node_info(&self, request: UpdateNodeInfoRequest) -> Result<UpdateNodeInfoResponse>;

    async fn shutdown_notice(&self, request: ShutdownNoticeRequest) -> Result<ShutdownNoticeResponse>;

    /// Register an observer of node liveness changes.
    fn on_connection_state_change(&self, handler: NodeConnectionHandler);
}
