//! Periodic control traffic of a connected compute node.

use super::health::HealthTracker;
use crate::envelope::Message;
use crate::error::{Error, Result};
use crate::messages::{
    HeartbeatRequest, HeartbeatResponse, Payload, ShutdownNoticeRequest, ShutdownNoticeResponse,
    UpdateNodeInfoRequest, UpdateNodeInfoResponse,
};
use crate::models::NodeInfo;
use crate::ncl::Publisher;
use crate::seq_tracker::SequenceTracker;
use crate::types::{Checkpointer, ConnectionState, NodeInfoProvider};
use nclprotocol_telemetry::{log_checkpoint_failed, log_heartbeat_failed, MetricsRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ControlPlaneConfig {
    pub node_id: String,
    /// Request channel to the orchestrator.
    pub publisher: Arc<dyn Publisher>,
    pub node_info_provider: Arc<dyn NodeInfoProvider>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub checkpoint_name: String,
    pub health_tracker: Arc<HealthTracker>,
    pub incoming_seq_tracker: Arc<SequenceTracker>,
    pub heartbeat_interval: Duration,
    pub node_info_update_interval: Duration,
    pub checkpoint_interval: Duration,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

impl ControlPlaneConfig {
    fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node id is required".into()));
        }
        for (name, value) in [
            ("heartbeat interval", self.heartbeat_interval),
            ("node info update interval", self.node_info_update_interval),
            ("checkpoint interval", self.checkpoint_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

struct Inner {
    config: ControlPlaneConfig,
    /// Node info the orchestrator last accepted.
    last_sent_node_info: Mutex<NodeInfo>,
    last_checkpoint: Mutex<u64>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Sends heartbeats and node info updates, and checkpoints the inbound
/// sequence number, while the node is connected.
pub struct ControlPlane {
    inner: Arc<Inner>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl ControlPlane {
    /// The current node info is taken as already known to the orchestrator,
    /// since it was sent with the handshake.
    pub fn new(config: ControlPlaneConfig) -> Result<Self> {
        config.validate()?;
        let node_info = config.node_info_provider.get_node_info();
        let last_checkpoint = config.incoming_seq_tracker.get_last_seq_num();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                last_sent_node_info: Mutex::new(node_info),
                last_checkpoint: Mutex::new(last_checkpoint),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(Error::AlreadyRunning("control plane"));
        }
        let cancel = CancellationToken::new();
        lifecycle.task = Some(tokio::spawn(self.inner.clone().run(cancel.clone())));
        lifecycle.cancel = Some(cancel);
        lifecycle.running = true;
        tracing::debug!(node_id = %self.inner.config.node_id, "control plane started");
        Ok(())
    }

    /// Stop the control plane.
    ///
    /// A connected node first tells the orchestrator it is leaving; a failed
    /// notice is logged and does not stop the shutdown. An already cancelled
    /// `ctx` skips the notice and returns [`Error::Cancelled`]. The inbound
    /// sequence number is checkpointed last.
    pub async fn stop(&self, ctx: &CancellationToken) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }
        lifecycle.running = false;
        let cancel = lifecycle.cancel.take();
        let task = lifecycle.task.take();

        if ctx.is_cancelled() {
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            return Err(Error::Cancelled);
        }

        if self.inner.config.health_tracker.get_state() == ConnectionState::Connected {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::warn!(node_id = %self.inner.config.node_id, "cancelled while sending shutdown notice");
                }
                result = self.inner.send_shutdown_notice() => {
                    if let Err(e) = result {
                        tracing::warn!(node_id = %self.inner.config.node_id, error = %e, "failed to send shutdown notice");
                    }
                }
            }
        }

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = task => {}
            }
        }

        self.inner.checkpoint().await;
        tracing::debug!(node_id = %self.inner.config.node_id, "control plane stopped");
        Ok(())
    }
}

impl Inner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut node_info = interval_at(
            start + self.config.node_info_update_interval,
            self.config.node_info_update_interval,
        );
        let mut checkpoint = interval_at(
            start + self.config.checkpoint_interval,
            self.config.checkpoint_interval,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = node_info.tick() => self.update_node_info().await,
                _ = checkpoint.tick() => self.checkpoint().await,
            }
        }
    }

    async fn request<Req: Payload, Resp: Payload>(&self, request: &Req) -> Result<Resp> {
        let response = self
            .config
            .publisher
            .request(Message::from_payload(request)?)
            .await?;
        response.decode()
    }

    async fn heartbeat(&self) {
        let node_info = self.config.node_info_provider.get_node_info();
        let request = HeartbeatRequest {
            node_id: self.config.node_id.clone(),
            available_capacity: node_info.compute_node_info.available_capacity,
            queue_used_capacity: node_info.compute_node_info.queue_used_capacity,
            last_orchestrator_seq_num: self.config.incoming_seq_tracker.get_last_seq_num(),
        };

        let result = self.request::<_, HeartbeatResponse>(&request).await;
        if let Some(metrics) = &self.config.metrics {
            metrics.record_heartbeat(&self.config.node_id, result.is_ok());
        }
        match result {
            Ok(_) => self.config.health_tracker.heartbeat_success(),
            Err(e) => {
                if e.is_handshake_required() {
                    self.config.health_tracker.handshake_required();
                }
                log_heartbeat_failed!(node_id = %self.config.node_id, error = %e, "heartbeat failed");
            }
        }
    }

    async fn update_node_info(&self) {
        let current = self.config.node_info_provider.get_node_info();
        if !self
            .last_sent_node_info
            .lock()
            .has_static_config_changed(&current)
        {
            return;
        }

        let request = UpdateNodeInfoRequest {
            node_info: current.clone(),
        };
        let result = match self.request::<_, UpdateNodeInfoResponse>(&request).await {
            Ok(response) if response.accepted => Ok(()),
            Ok(response) => Err(Error::NodeInfoRejected(response.reason)),
            Err(e) => Err(e),
        };
        if let Some(metrics) = &self.config.metrics {
            metrics.record_node_info_update(&self.config.node_id, result.is_ok());
        }
        match result {
            Ok(()) => {
                *self.last_sent_node_info.lock() = current;
                self.config.health_tracker.update_success();
                tracing::info!(node_id = %self.config.node_id, "node info updated");
            }
            Err(e) => {
                tracing::warn!(node_id = %self.config.node_id, error = %e, "failed to update node info");
            }
        }
    }

    async fn checkpoint(&self) {
        let seq_num = self.config.incoming_seq_tracker.get_last_seq_num();
        if seq_num == *self.last_checkpoint.lock() {
            return;
        }
        match self
            .config
            .checkpointer
            .checkpoint(&self.config.checkpoint_name, seq_num)
            .await
        {
            Ok(()) => *self.last_checkpoint.lock() = seq_num,
            Err(e) => {
                log_checkpoint_failed!(
                    node_id = %self.config.node_id,
                    checkpoint = %self.config.checkpoint_name,
                    seq_num,
                    error = %e,
                    "failed to checkpoint inbound sequence"
                );
            }
        }
    }

    async fn send_shutdown_notice(&self) -> Result<()> {
        let request = ShutdownNoticeRequest {
            node_id: self.config.node_id.clone(),
            last_orchestrator_seq_num: self.config.incoming_seq_tracker.get_last_seq_num(),
        };
        self.request::<_, ShutdownNoticeResponse>(&request).await?;
        tracing::info!(node_id = %self.config.node_id, "shutdown notice sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::KEY_MESSAGE_TYPE;
    use crate::messages::HandshakeResponse;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Records requests and answers them from canned responses.
    #[derive(Default)]
    struct FakeOrchestrator {
        requests: Mutex<Vec<Message>>,
        heartbeat_error: Mutex<Option<Error>>,
    }

    impl FakeOrchestrator {
        fn count(&self, message_type: &str) -> usize {
            self.requests
                .lock()
                .iter()
                .filter(|m| m.message_type() == Some(message_type))
                .count()
        }
    }

    #[async_trait]
    impl Publisher for FakeOrchestrator {
        async fn publish(&self, message: Message) -> Result<()> {
            self.requests.lock().push(message);
            Ok(())
        }

        async fn request(&self, message: Message) -> Result<Message> {
            let message_type = message
                .metadata_value(KEY_MESSAGE_TYPE)
                .unwrap_or_default()
                .to_string();
            self.requests.lock().push(message);
            match message_type.as_str() {
                "HeartbeatRequest" => match self.heartbeat_error.lock().take() {
                    Some(e) => Err(e),
                    None => Message::from_payload(&HeartbeatResponse {}),
                },
                "UpdateNodeInfoRequest" => Message::from_payload(&UpdateNodeInfoResponse {
                    accepted: true,
                    reason: String::new(),
                }),
                "ShutdownNoticeRequest" => Message::from_payload(&ShutdownNoticeResponse {}),
                _ => Message::from_payload(&HandshakeResponse::rejected("unexpected")),
            }
        }
    }

    struct Labels(Mutex<NodeInfo>);

    impl NodeInfoProvider for Labels {
        fn get_node_info(&self) -> NodeInfo {
            self.0.lock().clone()
        }
    }

    #[derive(Default)]
    struct MemoryCheckpoints(Mutex<HashMap<String, u64>>);

    #[async_trait]
    impl Checkpointer for MemoryCheckpoints {
        async fn checkpoint(&self, name: &str, seq_num: u64) -> Result<()> {
            self.0.lock().insert(name.to_string(), seq_num);
            Ok(())
        }

        async fn get_checkpoint(&self, name: &str) -> Result<u64> {
            Ok(self.0.lock().get(name).copied().unwrap_or_default())
        }
    }

    struct Fixture {
        orchestrator: Arc<FakeOrchestrator>,
        provider: Arc<Labels>,
        checkpoints: Arc<MemoryCheckpoints>,
        health: Arc<HealthTracker>,
        seq: Arc<SequenceTracker>,
        control_plane: ControlPlane,
    }

    fn fixture(interval: Duration) -> Fixture {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let provider = Arc::new(Labels(Mutex::new(NodeInfo {
            node_id: "node-1".into(),
            ..Default::default()
        })));
        let checkpoints = Arc::new(MemoryCheckpoints::default());
        let health = Arc::new(HealthTracker::new());
        let seq = Arc::new(SequenceTracker::new());
        let control_plane = ControlPlane::new(ControlPlaneConfig {
            node_id: "node-1".into(),
            publisher: orchestrator.clone(),
            node_info_provider: provider.clone(),
            checkpointer: checkpoints.clone(),
            checkpoint_name: "incoming-node-1".into(),
            health_tracker: health.clone(),
            incoming_seq_tracker: seq.clone(),
            heartbeat_interval: interval,
            node_info_update_interval: interval,
            checkpoint_interval: interval,
            metrics: None,
        })
        .unwrap();
        Fixture {
            orchestrator,
            provider,
            checkpoints,
            health,
            seq,
            control_plane,
        }
    }

    #[tokio::test]
    async fn test_heartbeats_carry_inbound_sequence() {
        let f = fixture(Duration::from_millis(20));
        f.seq.override_last_seq_num(124);
        f.control_plane.start().await.unwrap();
        assert!(matches!(
            f.control_plane.start().await,
            Err(Error::AlreadyRunning("control plane"))
        ));

        tokio::time::sleep(Duration::from_millis(70)).await;
        f.control_plane.stop(&CancellationToken::new()).await.unwrap();

        let heartbeat = f
            .orchestrator
            .requests
            .lock()
            .iter()
            .find(|m| m.message_type() == Some("HeartbeatRequest"))
            .cloned()
            .unwrap();
        let heartbeat: HeartbeatRequest = heartbeat.decode().unwrap();
        assert_eq!(heartbeat.last_orchestrator_seq_num, 124);
        assert_eq!(
            f.checkpoints.get_checkpoint("incoming-node-1").await.unwrap(),
            124
        );
    }

    #[tokio::test]
    async fn test_node_info_sent_only_on_change() {
        let f = fixture(Duration::from_millis(15));
        f.control_plane.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.orchestrator.count("UpdateNodeInfoRequest"), 0);

        f.provider
            .0
            .lock()
            .labels
            .insert("zone".into(), "eu-1".into());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(f.orchestrator.count("UpdateNodeInfoRequest"), 1);
        assert!(f.health.get_health().last_successful_update.is_some());

        f.control_plane.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_required_raises_flag() {
        let f = fixture(Duration::from_millis(15));
        *f.orchestrator.heartbeat_error.lock() = Some(Error::Remote {
            code: "HandshakeRequired".into(),
            message: "node node-1 is not connected".into(),
        });
        f.control_plane.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(f.health.get_health().handshake_required);
        f.control_plane.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_notice_only_when_connected() {
        let f = fixture(Duration::from_secs(60));
        f.control_plane.start().await.unwrap();
        f.control_plane.stop(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.orchestrator.count("ShutdownNoticeRequest"), 0);

        f.health.mark_connected();
        f.seq.override_last_seq_num(7);
        f.control_plane.start().await.unwrap();
        f.control_plane.stop(&CancellationToken::new()).await.unwrap();
        f.control_plane.stop(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.orchestrator.count("ShutdownNoticeRequest"), 1);
        assert_eq!(
            f.checkpoints.get_checkpoint("incoming-node-1").await.unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn test_cancelled_stop_sends_nothing() {
        let f = fixture(Duration::from_secs(60));
        f.health.mark_connected();
        f.control_plane.start().await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            f.control_plane.stop(&ctx).await,
            Err(Error::Cancelled)
        ));
        assert!(f.orchestrator.requests.lock().is_empty());
        f.control_plane.stop(&CancellationToken::new()).await.unwrap();
    }
}
