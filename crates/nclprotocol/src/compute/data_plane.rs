use crate::bus::BusClient;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{Error, Result, ResultExt};
use crate::logstream::{LogStreamHandler, LogStreamServer};
use crate::ncl::{OrderedBusPublisher, OrderedPublisher, OrderedPublisherConfig};
use crate::subjects;
use crate::types::MessageCreator;
use crate::watcher::{
    EventFilter, EventIterator, EventStore, EventWatcher, RetryStrategy, WatchOptions,
    EVENT_OBJECT_EXECUTION_UPSERT,
};
use nclprotocol_telemetry::MetricsRegistry;
use std::sync::Arc;

/// Watcher id of the compute node's outbound dispatcher.
pub const COMPUTE_DISPATCHER_ID: &str = "compute-ncl-dispatcher";

#[derive(Clone)]
pub struct DataPlaneConfig {
    pub node_id: String,
    pub client: Arc<dyn BusClient>,
    pub event_store: Arc<dyn EventStore>,
    pub message_creator: Arc<dyn MessageCreator>,
    pub log_stream_server: Arc<dyn LogStreamServer>,
    /// Last sequence number the orchestrator reported receiving from this node.
    pub last_received_seq_num: u64,
    pub dispatcher: DispatcherConfig,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

#[derive(Default)]
struct Components {
    running: bool,
    log_stream_handler: Option<LogStreamHandler>,
    publisher: Option<Arc<OrderedBusPublisher>>,
    dispatcher: Option<Dispatcher>,
}

/// Outbound execution events and inbound log stream requests of a
/// compute node.
pub struct DataPlane {
    config: DataPlaneConfig,
    components: tokio::sync::Mutex<Components>,
}

impl DataPlane {
    pub fn new(config: DataPlaneConfig) -> Result<Self> {
        if config.node_id.is_empty() {
            return Err(Error::InvalidConfig("node id is required".into()));
        }
        config.dispatcher.validate()?;
        Ok(Self {
            config,
            components: tokio::sync::Mutex::new(Components::default()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut components = self.components.lock().await;
        if components.running {
            return Err(Error::AlreadyRunning("data plane"));
        }
        if let Err(e) = self.start_components(&mut components).await {
            if let Err(cleanup) = cleanup(&mut components).await {
                tracing::warn!(node_id = %self.config.node_id, error = %cleanup, "failed to clean up data plane");
            }
            return Err(e);
        }
        components.running = true;
        tracing::debug!(
            node_id = %self.config.node_id,
            last_received_seq_num = self.config.last_received_seq_num,
            "data plane started"
        );
        Ok(())
    }

    async fn start_components(&self, components: &mut Components) -> Result<()> {
        let node_id = &self.config.node_id;

        let log_stream_handler = LogStreamHandler::new(
            self.config.client.clone(),
            self.config.log_stream_server.clone(),
            subjects::compute_in_requests(node_id),
        );
        log_stream_handler
            .start()
            .await
            .context("failed to start log stream handler")?;
        components.log_stream_handler = Some(log_stream_handler);

        let publisher = Arc::new(
            OrderedBusPublisher::new(
                self.config.client.clone(),
                OrderedPublisherConfig::new(
                    format!("compute-{node_id}"),
                    subjects::compute_out_msgs(node_id),
                ),
            )
            .await
            .context("failed to create ordered publisher")?,
        );
        components.publisher = Some(publisher.clone());

        let watcher = EventWatcher::new(
            COMPUTE_DISPATCHER_ID,
            self.config.event_store.clone(),
            WatchOptions::default()
                .with_initial_event_iterator(EventIterator::AfterSequenceNumber(
                    self.config.last_received_seq_num,
                ))
                .with_filter(EventFilter::object_types(&[EVENT_OBJECT_EXECUTION_UPSERT]))
                .with_retry_strategy(RetryStrategy::Block),
        )
        .await
        .context("failed to create event watcher")?;

        let dispatcher = Dispatcher::with_metrics(
            publisher,
            Arc::new(watcher),
            self.config.message_creator.clone(),
            self.config.dispatcher.clone(),
            self.config.metrics.clone(),
        )?;
        dispatcher.start().await.context("failed to start dispatcher")?;
        components.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Stop dispatching and serving. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut components = self.components.lock().await;
        if !components.running {
            return Ok(());
        }
        components.running = false;
        let result = cleanup(&mut components).await;
        tracing::debug!(node_id = %self.config.node_id, "data plane stopped");
        result
    }

    pub async fn is_running(&self) -> bool {
        self.components.lock().await.running
    }
}

async fn cleanup(components: &mut Components) -> Result<()> {
    let mut errors = Vec::new();
    if let Some(dispatcher) = components.dispatcher.take() {
        if let Err(e) = dispatcher.stop().await {
            errors.push(e.context("failed to stop dispatcher"));
        }
    }
    if let Some(publisher) = components.publisher.take() {
        if let Err(e) = publisher.close().await {
            errors.push(e.context("failed to close publisher"));
        }
    }
    if let Some(handler) = components.log_stream_handler.take() {
        if let Err(e) = handler.close().await {
            errors.push(e.context("failed to close log stream handler"));
        }
    }
    Error::join(errors)
}
