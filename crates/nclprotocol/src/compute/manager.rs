//! Connection lifecycle of a compute node.

use super::config::{Config, Dependencies};
use super::control_plane::{ControlPlane, ControlPlaneConfig};
use super::data_plane::{DataPlane, DataPlaneConfig};
use super::health::HealthTracker;
use crate::backoff::sleep_or_cancel;
use crate::bus::BusClient;
use crate::envelope::Message;
use crate::error::{Error, Result, ResultExt};
use crate::messages::{HandshakeRequest, HandshakeResponse};
use crate::ncl::{BusPublisher, Publisher, PublisherConfig, Subscriber, SubscriberConfig};
use crate::seq_tracker::SequenceTracker;
use crate::subjects;
use crate::types::{ConnectionHealth, ConnectionState, ConnectionStateHandler};
use chrono::Utc;
use nclprotocol_telemetry::{
    log_connection_state_changed, log_handshake_completed, log_handshake_rejected,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

/// Capacity of the state change notification queue. Transitions beyond it
/// are dropped with an error log.
const STATE_CHANGE_BUFFER: usize = 32;

#[derive(Default)]
struct Components {
    client: Option<Arc<dyn BusClient>>,
    subscriber: Option<Subscriber>,
    control_plane: Option<ControlPlane>,
    data_plane: Option<DataPlane>,
}

struct Inner {
    config: Config,
    deps: Dependencies,
    health: Arc<HealthTracker>,
    incoming_seq_tracker: Arc<SequenceTracker>,
    // Serializes connect, health-driven disconnect and teardown.
    components: tokio::sync::Mutex<Components>,
    handlers: RwLock<Vec<ConnectionStateHandler>>,
    state_tx: Mutex<Option<mpsc::Sender<ConnectionState>>>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    cancel: Option<CancellationToken>,
    maintainer: Option<JoinHandle<()>>,
    // Exits once the state channel is closed, after delivering what is queued.
    notifier: Option<JoinHandle<()>>,
}

/// Keeps a compute node connected to the orchestrator.
///
/// After [`start`](Self::start) the manager connects, performs the handshake
/// and runs the control and data planes. A background loop reconnects with
/// backoff when the connection is lost or its health check fails.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl ConnectionManager {
    pub fn new(config: Config, deps: Dependencies) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                deps,
                health: Arc::new(HealthTracker::new()),
                incoming_seq_tracker: Arc::new(SequenceTracker::new()),
                components: tokio::sync::Mutex::new(Components::default()),
                handlers: RwLock::new(Vec::new()),
                state_tx: Mutex::new(None),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(Error::AlreadyRunning("connection manager"));
        }

        let checkpoint_name = self.inner.config.checkpoint_name();
        let seq_num = self
            .inner
            .deps
            .checkpointer
            .get_checkpoint(&checkpoint_name)
            .await
            .context("failed to read inbound checkpoint")?;
        self.inner.incoming_seq_tracker.update_last_seq_num(seq_num);

        let (tx, rx) = mpsc::channel(STATE_CHANGE_BUFFER);
        *self.inner.state_tx.lock() = Some(tx);

        let cancel = CancellationToken::new();
        lifecycle.notifier = Some(tokio::spawn(self.inner.clone().notify_loop(rx)));
        lifecycle.maintainer = Some(tokio::spawn(
            self.inner.clone().maintain_connection(cancel.clone()),
        ));
        lifecycle.cancel = Some(cancel);
        lifecycle.running = true;

        tracing::info!(
            node_id = %self.inner.config.node_id,
            last_orchestrator_seq_num = seq_num,
            "connection manager started"
        );
        Ok(())
    }

    /// Stop reconnecting and tear the connection down. Waiting for the
    /// background loops is bounded by `ctx`. Closing twice is a no-op.
    pub async fn close(&self, ctx: &CancellationToken) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }
        lifecycle.running = false;

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = lifecycle.maintainer.take() {
            self.wait_for(task, ctx, "connection loop").await;
        }

        let result = {
            let mut components = self.inner.components.lock().await;
            self.inner.teardown(&mut components, ctx).await
        };
        self.inner.transition(ConnectionState::Disconnected, None);
        // Dropping the sender lets the notifier deliver the final transition
        // and exit.
        *self.inner.state_tx.lock() = None;
        if let Some(task) = lifecycle.notifier.take() {
            self.wait_for(task, ctx, "state change notifier").await;
        }

        tracing::info!(node_id = %self.inner.config.node_id, "connection manager closed");
        result
    }

    async fn wait_for(&self, task: JoinHandle<()>, ctx: &CancellationToken, name: &str) {
        tokio::select! {
            _ = ctx.cancelled() => {
                tracing::warn!(node_id = %self.inner.config.node_id, task = name, "cancelled while waiting for background task");
            }
            _ = task => {}
        }
    }

    /// Register an observer of state transitions. Observers run in
    /// registration order on a dedicated task.
    pub fn on_state_change(&self, handler: ConnectionStateHandler) {
        self.inner.handlers.write().push(handler);
    }

    pub fn get_health(&self) -> ConnectionHealth {
        self.inner.health.get_health()
    }
}

impl Inner {
    async fn notify_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ConnectionState>) {
        while let Some(state) = rx.recv().await {
            let handlers: Vec<_> = self.handlers.read().iter().cloned().collect();
            for handler in handlers {
                handler(state);
            }
        }
    }

    async fn maintain_connection(self: Arc<Self>, cancel: CancellationToken) {
        self.connect_or_backoff(&cancel).await;

        let interval = self.config.reconnect_interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.health.get_state() {
                ConnectionState::Disconnected => self.connect_or_backoff(&cancel).await,
                ConnectionState::Connected => self.check_connection_health().await,
                ConnectionState::Connecting => {}
            }
        }
    }

    async fn connect_or_backoff(&self, cancel: &CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.connect() => result,
        };
        if let Err(e) = result {
            let failures = self.health.get_health().consecutive_failures;
            let wait = self.config.reconnect_backoff.backoff_duration(failures);
            tracing::warn!(
                node_id = %self.config.node_id,
                failures,
                backoff = ?wait,
                error = %e,
                "failed to connect to orchestrator"
            );
            sleep_or_cancel(wait, cancel).await;
        }
    }

    async fn connect(&self) -> Result<()> {
        let mut components = self.components.lock().await;
        if self.health.get_state() == ConnectionState::Connected {
            return Ok(());
        }
        self.transition(ConnectionState::Connecting, None);

        if let Err(e) = self.teardown(&mut components, &CancellationToken::new()).await {
            tracing::debug!(node_id = %self.config.node_id, error = %e, "failed to clean up stale connection");
        }

        match self.establish(&mut components).await {
            Ok(()) => {
                self.transition(ConnectionState::Connected, None);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.teardown(&mut components, &CancellationToken::new()).await {
                    tracing::debug!(node_id = %self.config.node_id, error = %cleanup, "failed to clean up after connect failure");
                }
                self.transition(ConnectionState::Disconnected, Some(&e));
                Err(e)
            }
        }
    }

    async fn establish(&self, components: &mut Components) -> Result<()> {
        let node_id = &self.config.node_id;

        let client = self
            .deps
            .client_factory
            .create_client()
            .await
            .context("failed to connect to message bus")?;
        components.client = Some(client.clone());

        // Subscribe before the handshake so nothing sent right after
        // acceptance is missed.
        let subscriber = Subscriber::new(
            client.clone(),
            SubscriberConfig::new(format!("compute-{node_id}"), self.deps.message_handler.clone())
                .with_notifier(self.incoming_seq_tracker.clone()),
        );
        subscriber
            .subscribe(&subjects::compute_in_msgs(node_id))
            .await
            .context("failed to subscribe to inbound messages")?;
        components.subscriber = Some(subscriber);

        let publisher: Arc<dyn Publisher> = Arc::new(BusPublisher::new(
            client.clone(),
            PublisherConfig::new(format!("compute-{node_id}"), subjects::compute_out_ctrl(node_id))
                .with_request_timeout(self.config.request_timeout),
        )?);

        let request = HandshakeRequest {
            node_info: self.deps.node_info_provider.get_node_info(),
            start_time: self.health.get_health().start_time,
            last_orchestrator_seq_num: self.incoming_seq_tracker.get_last_seq_num(),
        };
        let response: HandshakeResponse = publisher
            .request(Message::from_payload(&request)?)
            .await
            .context("handshake failed")?
            .decode()?;
        if !response.accepted {
            log_handshake_rejected!(node_id = %node_id, reason = %response.reason, "handshake rejected");
            return Err(Error::HandshakeRejected(response.reason));
        }

        self.incoming_seq_tracker
            .override_last_seq_num(response.starting_orchestrator_seq_num);

        let control_plane = ControlPlane::new(ControlPlaneConfig {
            node_id: node_id.clone(),
            publisher,
            node_info_provider: self.deps.node_info_provider.clone(),
            checkpointer: self.deps.checkpointer.clone(),
            checkpoint_name: self.config.checkpoint_name(),
            health_tracker: self.health.clone(),
            incoming_seq_tracker: self.incoming_seq_tracker.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            node_info_update_interval: self.config.node_info_update_interval,
            checkpoint_interval: self.config.checkpoint_interval,
            metrics: self.deps.metrics.clone(),
        })?;
        control_plane.start().await?;
        components.control_plane = Some(control_plane);

        let data_plane = DataPlane::new(DataPlaneConfig {
            node_id: node_id.clone(),
            client,
            event_store: self.deps.event_store.clone(),
            message_creator: self.deps.message_creator.clone(),
            log_stream_server: self.deps.log_stream_server.clone(),
            last_received_seq_num: response.last_compute_seq_num,
            dispatcher: self.config.dispatcher.clone(),
            metrics: self.deps.metrics.clone(),
        })?;
        data_plane.start().await?;
        components.data_plane = Some(data_plane);

        log_handshake_completed!(
            node_id = %node_id,
            starting_orchestrator_seq_num = response.starting_orchestrator_seq_num,
            last_compute_seq_num = response.last_compute_seq_num,
            "connected to orchestrator"
        );
        Ok(())
    }

    /// Stop and drop every component: data plane, control plane, subscriber,
    /// then the bus connection.
    async fn teardown(&self, components: &mut Components, ctx: &CancellationToken) -> Result<()> {
        let mut errors = Vec::new();
        if let Some(data_plane) = components.data_plane.take() {
            if let Err(e) = data_plane.stop().await {
                errors.push(e.context("failed to stop data plane"));
            }
        }
        if let Some(control_plane) = components.control_plane.take() {
            if let Err(e) = control_plane.stop(ctx).await {
                errors.push(e.context("failed to stop control plane"));
            }
        }
        if let Some(subscriber) = components.subscriber.take() {
            if let Err(e) = subscriber.close().await {
                errors.push(e.context("failed to close subscriber"));
            }
        }
        if let Some(client) = components.client.take() {
            client.close().await;
        }
        Error::join(errors)
    }

    async fn check_connection_health(&self) {
        let Some(reason) = self.unhealthy_reason().await else {
            return;
        };
        let mut components = self.components.lock().await;
        if self.health.get_state() != ConnectionState::Connected {
            return;
        }
        let err = Error::Unhealthy(reason);
        self.transition(ConnectionState::Disconnected, Some(&err));
        if let Err(e) = self.teardown(&mut components, &CancellationToken::new()).await {
            tracing::debug!(node_id = %self.config.node_id, error = %e, "failed to clean up unhealthy connection");
        }
    }

    async fn unhealthy_reason(&self) -> Option<String> {
        let health = self.health.get_health();
        if health.handshake_required {
            return Some("orchestrator requires a new handshake".into());
        }

        let timeout = self.config.heartbeat_timeout();
        let since = health
            .last_successful_heartbeat
            .or(health.connected_since)
            .map(|t| (Utc::now() - t).to_std().unwrap_or_default());
        if let Some(since) = since {
            if since > timeout {
                return Some(format!(
                    "no successful heartbeat for {since:?}, limit is {timeout:?}"
                ));
            }
        }

        let closed = self
            .components
            .lock()
            .await
            .client
            .as_ref()
            .is_some_and(|c| c.is_closed());
        if closed {
            return Some("bus connection closed".into());
        }
        None
    }

    fn transition(&self, state: ConnectionState, err: Option<&Error>) {
        let previous = self.health.get_state();
        match state {
            ConnectionState::Connecting => self.health.mark_connecting(),
            ConnectionState::Connected => self.health.mark_connected(),
            ConnectionState::Disconnected => self.health.mark_disconnected(err),
        }
        if previous == state {
            return;
        }

        log_connection_state_changed!(
            node_id = %self.config.node_id,
            from = %previous,
            to = %state,
            error = %err.map(ToString::to_string).unwrap_or_default(),
            "connection state changed"
        );
        if let Some(metrics) = &self.deps.metrics {
            metrics.record_state_transition(&self.config.node_id, &state.to_string());
        }
        if let Some(tx) = self.state_tx.lock().as_ref() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(state) {
                tracing::error!(
                    node_id = %self.config.node_id,
                    state = %state,
                    "state change notification queue full, dropping notification"
                );
            }
        }
    }
}
