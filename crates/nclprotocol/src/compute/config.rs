use crate::backoff::{Backoff, ExponentialBackoff};
use crate::bus::ClientFactory;
use crate::dispatcher::DispatcherConfig;
use crate::error::{Error, Result};
use crate::logstream::LogStreamServer;
use crate::ncl::MessageHandler;
use crate::types::{Checkpointer, MessageCreator, NodeInfoProvider};
use crate::watcher::EventStore;
use nclprotocol_telemetry::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Timing and identity of a compute node's connection.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals without a successful heartbeat before the
    /// connection is considered dead.
    pub heartbeat_miss_factor: u32,
    pub node_info_update_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_backoff: Arc<dyn Backoff>,
    /// How often the inbound sequence number is persisted.
    pub checkpoint_interval: Duration,
    pub dispatcher: DispatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_miss_factor: 5,
            node_info_update_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(10),
            reconnect_backoff: Arc::new(ExponentialBackoff::RECONNECT),
            checkpoint_interval: Duration::from_secs(30),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Config {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_miss_factor(mut self, factor: u32) -> Self {
        self.heartbeat_miss_factor = factor;
        self
    }

    pub fn with_node_info_update_interval(mut self, interval: Duration) -> Self {
        self.node_info_update_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Time without a successful heartbeat after which the connection is stale.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_factor
    }

    /// Checkpoint name of the inbound sequence number.
    pub fn checkpoint_name(&self) -> String {
        format!("incoming-{}", self.node_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node id is required".into()));
        }
        let positive = [
            ("heartbeat interval", self.heartbeat_interval),
            ("node info update interval", self.node_info_update_interval),
            ("request timeout", self.request_timeout),
            ("reconnect interval", self.reconnect_interval),
            ("checkpoint interval", self.checkpoint_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.heartbeat_miss_factor == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat miss factor must be at least 1".into(),
            ));
        }
        self.dispatcher.validate()
    }
}

/// Collaborators of a compute node's connection.
#[derive(Clone)]
pub struct Dependencies {
    pub client_factory: Arc<dyn ClientFactory>,
    pub node_info_provider: Arc<dyn NodeInfoProvider>,
    /// Handles messages arriving from the orchestrator.
    pub message_handler: Arc<dyn MessageHandler>,
    /// Turns local execution events into messages for the orchestrator.
    pub message_creator: Arc<dyn MessageCreator>,
    pub event_store: Arc<dyn EventStore>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub log_stream_server: Arc<dyn LogStreamServer>,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

impl Dependencies {
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
