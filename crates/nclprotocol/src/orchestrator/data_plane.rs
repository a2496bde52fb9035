use crate::bus::BusClient;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{Error, Result, ResultExt};
use crate::ncl::{
    MessageHandler, OrderedBusPublisher, OrderedPublisher, OrderedPublisherConfig, Subscriber,
    SubscriberConfig,
};
use crate::seq_tracker::SequenceTracker;
use crate::subjects;
use crate::types::MessageCreatorFactory;
use crate::watcher::{
    EventFilter, EventIterator, EventStore, EventWatcher, RetryStrategy, WatchOptions,
    EVENT_OBJECT_EXECUTION_UPSERT,
};
use nclprotocol_telemetry::MetricsRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Watcher id of the dispatcher serving `node_id`.
pub fn dispatcher_id(node_id: &str) -> String {
    format!("orchestrator-dispatcher-{node_id}")
}

#[derive(Clone)]
pub struct DataPlaneConfig {
    pub node_id: String,
    pub client: Arc<dyn BusClient>,
    pub message_handler: Arc<dyn MessageHandler>,
    pub message_creator_factory: Arc<dyn MessageCreatorFactory>,
    pub event_store: Arc<dyn EventStore>,
    /// Dispatch events after this sequence number.
    pub start_seq_num: u64,
    /// Last node message already processed in an earlier session.
    pub last_compute_seq_num: u64,
    pub dispatcher: DispatcherConfig,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

#[derive(Default)]
struct Components {
    subscriber: Option<Subscriber>,
    publisher: Option<Arc<OrderedBusPublisher>>,
    dispatcher: Option<Dispatcher>,
}

/// Message exchange with one connected compute node.
pub struct DataPlane {
    config: DataPlaneConfig,
    incoming_seq_tracker: Arc<SequenceTracker>,
    running: AtomicBool,
    components: tokio::sync::Mutex<Components>,
}

impl DataPlane {
    pub fn new(config: DataPlaneConfig) -> Result<Self> {
        if config.node_id.is_empty() {
            return Err(Error::InvalidConfig("node id is required".into()));
        }
        config.dispatcher.validate()?;
        let incoming_seq_tracker =
            Arc::new(SequenceTracker::new().with_last_seq_num(config.last_compute_seq_num));
        Ok(Self {
            config,
            incoming_seq_tracker,
            running: AtomicBool::new(false),
            components: tokio::sync::Mutex::new(Components::default()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn start(&self) -> Result<()> {
        let mut components = self.components.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("data plane"));
        }
        if let Err(e) = self.start_components(&mut components).await {
            if let Err(cleanup) = cleanup(&mut components).await {
                tracing::warn!(node_id = %self.config.node_id, error = %cleanup, "failed to clean up data plane");
            }
            return Err(e);
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!(
            node_id = %self.config.node_id,
            start_seq_num = self.config.start_seq_num,
            "data plane started"
        );
        Ok(())
    }

    async fn start_components(&self, components: &mut Components) -> Result<()> {
        let node_id = &self.config.node_id;
        let name = format!("orchestrator-{node_id}");

        let subscriber = Subscriber::new(
            self.config.client.clone(),
            SubscriberConfig::new(name.clone(), self.config.message_handler.clone())
                .with_notifier(self.incoming_seq_tracker.clone()),
        );
        subscriber
            .subscribe(&subjects::orchestrator_in_msgs(node_id))
            .await
            .context("failed to subscribe to node messages")?;
        components.subscriber = Some(subscriber);

        let publisher = Arc::new(
            OrderedBusPublisher::new(
                self.config.client.clone(),
                OrderedPublisherConfig::new(name, subjects::orchestrator_out_msgs(node_id)),
            )
            .await
            .context("failed to create ordered publisher")?,
        );
        components.publisher = Some(publisher.clone());

        let creator = self
            .config
            .message_creator_factory
            .create_message_creator(node_id)
            .await
            .context("failed to create message creator")?;
        let watcher = EventWatcher::new(
            dispatcher_id(node_id),
            self.config.event_store.clone(),
            WatchOptions::default()
                .with_initial_event_iterator(EventIterator::AfterSequenceNumber(
                    self.config.start_seq_num,
                ))
                .with_filter(EventFilter::object_types(&[EVENT_OBJECT_EXECUTION_UPSERT]))
                .with_retry_strategy(RetryStrategy::Block),
        )
        .await
        .context("failed to create event watcher")?;

        let dispatcher = Dispatcher::with_metrics(
            publisher,
            Arc::new(watcher),
            creator,
            self.config.dispatcher.clone().without_checkpointing(),
            self.config.metrics.clone(),
        )?;
        dispatcher.start().await.context("failed to start dispatcher")?;
        components.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Stop the data plane. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut components = self.components.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = cleanup(&mut components).await;
        tracing::debug!(node_id = %self.config.node_id, "data plane stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Last sequence number processed from the node.
    pub fn get_last_processed_sequence(&self) -> u64 {
        self.incoming_seq_tracker.get_last_seq_num()
    }
}

async fn cleanup(components: &mut Components) -> Result<()> {
    let mut errors = Vec::new();
    if let Some(dispatcher) = components.dispatcher.take() {
        if let Err(e) = dispatcher.stop().await {
            errors.push(e.context("failed to stop dispatcher"));
        }
    }
    if let Some(subscriber) = components.subscriber.take() {
        if let Err(e) = subscriber.close().await {
            errors.push(e.context("failed to close subscriber"));
        }
    }
    if let Some(publisher) = components.publisher.take() {
        if let Err(e) = publisher.close().await {
            errors.push(e.context("failed to close publisher"));
        }
    }
    Error::join(errors)
}
