//! Control-plane protocol payloads.

use crate::models::{NodeInfo, Resources};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload with a fixed message type.
pub trait Payload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: &'static str;
}

macro_rules! payload {
    ($ty:ty, $name:literal) => {
        impl Payload for $ty {
            const MESSAGE_TYPE: &'static str = $name;
        }
    };
}

/// First message of a session, sent by the compute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_info: NodeInfo,
    pub start_time: DateTime<Utc>,
    /// Last orchestrator message sequence the node processed.
    pub last_orchestrator_seq_num: u64,
}

/// Orchestrator's answer to a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
    /// Sequence the node should consider itself caught up to.
    pub starting_orchestrator_seq_num: u64,
    /// Last compute message sequence the orchestrator processed.
    pub last_compute_seq_num: u64,
}

impl HandshakeResponse {
    pub fn accepted(starting_orchestrator_seq_num: u64, last_compute_seq_num: u64) -> Self {
        Self {
            accepted: true,
            reason: String::new(),
            starting_orchestrator_seq_num,
            last_compute_seq_num,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub available_capacity: Resources,
    pub queue_used_capacity: Resources,
    pub last_orchestrator_seq_num: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {}

/// Heartbeat as handed to the node manager, enriched with the data plane's
/// progress on the node's outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedHeartbeatRequest {
    #[serde(flatten)]
    pub heartbeat: HeartbeatRequest,
    pub last_compute_seq_num: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeInfoRequest {
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeInfoResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
}

/// Sent by a compute node that is shutting down cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownNoticeRequest {
    pub node_id: String,
    pub last_orchestrator_seq_num: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownNoticeResponse {}

payload!(HandshakeRequest, "HandshakeRequest");
payload!(HandshakeResponse, "HandshakeResponse");
payload!(HeartbeatRequest, "HeartbeatRequest");
payload!(HeartbeatResponse, "HeartbeatResponse");
payload!(UpdateNodeInfoRequest, "UpdateNodeInfoRequest");
payload!(UpdateNodeInfoResponse, "UpdateNodeInfoResponse");
payload!(ShutdownNoticeRequest, "ShutdownNoticeRequest");
payload!(ShutdownNoticeResponse, "ShutdownNoticeResponse");
