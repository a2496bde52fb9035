//! TestOrchestrator and TestNode: both ends of the transport on one bus.

use crate::mocks::{
    MockCheckpointer, MockLogStreamServer, MockMessageCreator, MockMessageHandler,
    MockNodeInfoProvider, MockNodeManager,
};
use nclprotocol::bus::MemoryBus;
use nclprotocol::compute::{self, ConnectionManager};
use nclprotocol::dispatcher::DispatcherConfig;
use nclprotocol::orchestrator::{self, ComputeManager};
use nclprotocol::watcher::{InMemoryEventStore, Operation, EVENT_OBJECT_EXECUTION_UPSERT};
use nclprotocol::{ConnectionState, ExponentialBackoff};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors from harness operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("transport error: {0}")]
    Transport(#[from] nclprotocol::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(
    timeout: Duration,
    what: &str,
    mut condition: impl FnMut() -> bool,
) -> Result<(), TestError> {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TestError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Dispatcher timing scaled down for tests.
pub fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig::new()
        .with_checkpoint_interval(Duration::from_millis(50))
        .with_stall_timeout(Duration::from_secs(5))
        .with_stall_check_interval(Duration::from_secs(1))
        .with_process_interval(Duration::from_millis(10))
        .with_seek_timeout(Duration::from_secs(1))
        .with_retry_intervals(Duration::from_millis(20), Duration::from_millis(200))
}

/// Orchestrator side: a real [`ComputeManager`] over mock policy.
pub struct TestOrchestrator {
    pub node_manager: Arc<MockNodeManager>,
    /// Receives data messages from every node.
    pub handler: Arc<MockMessageHandler>,
    pub event_store: Arc<InMemoryEventStore>,
    pub manager: ComputeManager,
}

impl TestOrchestrator {
    pub async fn start(bus: &MemoryBus) -> Result<Self, TestError> {
        let config = orchestrator::Config::new()
            .with_dispatcher(fast_dispatcher_config())
            .with_data_plane_stop_timeout(Duration::from_secs(1));
        Self::with_config(bus, config).await
    }

    pub async fn with_config(
        bus: &MemoryBus,
        config: orchestrator::Config,
    ) -> Result<Self, TestError> {
        let node_manager = Arc::new(MockNodeManager::new());
        let handler = Arc::new(MockMessageHandler::new());
        let event_store = Arc::new(InMemoryEventStore::new());

        let manager = ComputeManager::new(
            config,
            orchestrator::Dependencies {
                client_factory: Arc::new(bus.clone()),
                node_manager: node_manager.clone(),
                message_handler: handler.clone(),
                message_creator_factory: Arc::new(MockMessageCreator::new()),
                event_store: event_store.clone(),
                metrics: None,
            },
        )?;
        manager.start().await?;

        Ok(Self {
            node_manager,
            handler,
            event_store,
            manager,
        })
    }

    /// Record an execution event addressed to `node_id`. Returns its
    /// sequence number.
    pub fn send_to_node(&self, node_id: &str, data: serde_json::Value) -> u64 {
        self.event_store.store_event(
            Operation::Create,
            EVENT_OBJECT_EXECUTION_UPSERT,
            serde_json::json!({ "node_id": node_id, "data": data }),
        )
    }

    pub async fn stop(&self) -> Result<(), TestError> {
        self.manager.stop(&CancellationToken::new()).await?;
        Ok(())
    }
}

/// Compute side: a real [`ConnectionManager`] over mock capabilities.
pub struct TestNode {
    pub node_id: String,
    pub node_info: Arc<MockNodeInfoProvider>,
    /// Receives data messages from the orchestrator.
    pub handler: Arc<MockMessageHandler>,
    pub checkpointer: Arc<MockCheckpointer>,
    pub event_store: Arc<InMemoryEventStore>,
    pub manager: ConnectionManager,
    states: Arc<Mutex<Vec<ConnectionState>>>,
}

impl TestNode {
    /// Node timing scaled down for tests: 50ms heartbeats, three misses
    /// allowed.
    pub fn fast_config(node_id: &str) -> compute::Config {
        let backoff = ExponentialBackoff::new(Duration::from_millis(20), Duration::from_millis(200))
            .expect("valid backoff");
        compute::Config::new(node_id)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_heartbeat_miss_factor(3)
            .with_node_info_update_interval(Duration::from_millis(100))
            .with_request_timeout(Duration::from_millis(500))
            .with_reconnect_interval(Duration::from_millis(50))
            .with_reconnect_backoff(Arc::new(backoff))
            .with_checkpoint_interval(Duration::from_millis(50))
            .with_dispatcher(fast_dispatcher_config())
    }

    pub async fn start(bus: &MemoryBus, node_id: &str) -> Result<Self, TestError> {
        Self::start_with(bus, Self::fast_config(node_id), Arc::new(MockCheckpointer::new())).await
    }

    pub async fn start_with(
        bus: &MemoryBus,
        config: compute::Config,
        checkpointer: Arc<MockCheckpointer>,
    ) -> Result<Self, TestError> {
        let node_id = config.node_id.clone();
        let node_info = Arc::new(MockNodeInfoProvider::new(node_id.clone()));
        let handler = Arc::new(MockMessageHandler::new());
        let event_store = Arc::new(InMemoryEventStore::new());

        let manager = ConnectionManager::new(
            config,
            compute::Dependencies {
                client_factory: Arc::new(bus.clone()),
                node_info_provider: node_info.clone(),
                message_handler: handler.clone(),
                message_creator: Arc::new(MockMessageCreator::new()),
                event_store: event_store.clone(),
                checkpointer: checkpointer.clone(),
                log_stream_server: Arc::new(MockLogStreamServer::with_lines(["hello", "world"])),
                metrics: None,
            },
        )?;

        let states = Arc::new(Mutex::new(Vec::new()));
        let observed = states.clone();
        manager.on_state_change(Arc::new(move |state: ConnectionState| observed.lock().push(state)));
        manager.start().await?;

        Ok(Self {
            node_id,
            node_info,
            handler,
            checkpointer,
            event_store,
            manager,
            states,
        })
    }

    /// Record an execution event for the orchestrator. Returns its sequence
    /// number.
    pub fn send_to_orchestrator(&self, data: serde_json::Value) -> u64 {
        self.event_store.store_event(
            Operation::Create,
            EVENT_OBJECT_EXECUTION_UPSERT,
            serde_json::json!({ "node_id": self.node_id, "data": data }),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.get_health().current_state
    }

    /// Every state delivered to observers so far.
    pub fn observed_states(&self) -> Vec<ConnectionState> {
        self.states.lock().clone()
    }

    pub async fn wait_for_state(
        &self,
        state: ConnectionState,
        timeout: Duration,
    ) -> Result<(), TestError> {
        eventually(timeout, &format!("node {} to be {state}", self.node_id), || {
            self.state() == state
        })
        .await
    }

    pub async fn close(&self) -> Result<(), TestError> {
        self.manager.close(&CancellationToken::new()).await?;
        Ok(())
    }
}
