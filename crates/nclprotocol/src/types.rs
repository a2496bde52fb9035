//! Shared connection types and the capabilities the transport consumes.

use crate::envelope::Message;
use crate::error::Result;
use crate::models::NodeInfo;
use crate::watcher::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// State of a compute node's connection to the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        f.write_str(s)
    }
}

/// Snapshot of a connection's health.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHealth {
    pub start_time: DateTime<Utc>,
    pub last_successful_heartbeat: Option<DateTime<Utc>>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub current_state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub handshake_required: bool,
}

/// Callback invoked on every connection state transition.
pub type ConnectionStateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Durable `name → sequence number` store.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self, name: &str, seq_num: u64) -> Result<()>;

    /// Stored value, or 0 when nothing was stored under `name`.
    async fn get_checkpoint(&self, name: &str) -> Result<u64>;
}

/// Source of the local node's description.
pub trait NodeInfoProvider: Send + Sync {
    fn get_node_info(&self) -> NodeInfo;
}

/// Turns store events into outbound messages.
pub trait MessageCreator: Send + Sync {
    /// `Ok(None)` means the event is not meant for the remote side.
    fn create_message(&self, event: &Event) -> Result<Option<Message>>;
}

/// Builds a message creator per connected node.
#[async_trait]
pub trait MessageCreatorFactory: Send + Sync {
    async fn create_message_creator(&self, node_id: &str) -> Result<Arc<dyn MessageCreator>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
