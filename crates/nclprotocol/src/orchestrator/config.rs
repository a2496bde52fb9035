use super::NodeManager;
use crate::bus::ClientFactory;
use crate::dispatcher::DispatcherConfig;
use crate::error::{Error, Result};
use crate::ncl::MessageHandler;
use crate::types::MessageCreatorFactory;
use crate::watcher::EventStore;
use nclprotocol_telemetry::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Dispatcher settings for every per-node data plane. Checkpointing is
    /// always disabled there; the handshake carries the resume point.
    pub dispatcher: DispatcherConfig,
    /// Upper bound on stopping one node's data plane.
    pub data_plane_stop_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            data_plane_stop_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_data_plane_stop_timeout(mut self, timeout: Duration) -> Self {
        self.data_plane_stop_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_plane_stop_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "data plane stop timeout must be positive".into(),
            ));
        }
        self.dispatcher.validate()
    }
}

/// Collaborators of the orchestrator side.
#[derive(Clone)]
pub struct Dependencies {
    pub client_factory: Arc<dyn ClientFactory>,
    pub node_manager: Arc<dyn NodeManager>,
    /// Handles messages arriving from compute nodes.
    pub message_handler: Arc<dyn MessageHandler>,
    pub message_creator_factory: Arc<dyn MessageCreatorFactory>,
    pub event_store: Arc<dyn EventStore>,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

impl Dependencies {
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
