//! Per-node session management on the orchestrator.

use super::config::{Config, Dependencies};
use super::data_plane::{DataPlane, DataPlaneConfig};
use super::{NodeConnectionEvent, NodeConnectionState};
use crate::bus::BusClient;
use crate::envelope::Message;
use crate::error::{Error, Result, ResultExt};
use crate::messages::{
    ExtendedHeartbeatRequest, HandshakeRequest, HandshakeResponse, HeartbeatRequest, Payload,
    ShutdownNoticeRequest, UpdateNodeInfoRequest,
};
use crate::ncl::{RequestHandler, Responder};
use crate::subjects;
use dashmap::DashMap;
use nclprotocol_telemetry::{log_handshake_completed, log_handshake_rejected};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

struct Inner {
    config: Config,
    deps: Dependencies,
    client: RwLock<Option<Arc<dyn BusClient>>>,
    data_planes: DashMap<String, Arc<DataPlane>>,
    // Serializes replacing and removing data planes so a node never has two
    // running at once.
    swap_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    responder: Option<Responder>,
}

/// Serves control requests from compute nodes and runs one data plane per
/// connected node.
pub struct ComputeManager {
    inner: Arc<Inner>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl ComputeManager {
    /// Must be called inside a tokio runtime. Disconnect notifications from
    /// the node manager may arrive on any thread; their cleanup runs on that
    /// runtime.
    pub fn new(config: Config, deps: Dependencies) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidConfig("compute manager must be created inside a tokio runtime".into())
        })?;
        let inner = Arc::new(Inner {
            config,
            deps,
            client: RwLock::new(None),
            data_planes: DashMap::new(),
            swap_lock: tokio::sync::Mutex::new(()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner
            .deps
            .node_manager
            .on_connection_state_change(Arc::new(move |event: NodeConnectionEvent| {
                if event.current != NodeConnectionState::Disconnected {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                // Only the plane that was current at disconnect time goes; a
                // handshake racing with this event keeps its new plane.
                let Some(current) = inner.data_planes.get(&event.node_id).map(|e| e.value().clone())
                else {
                    return;
                };
                runtime.spawn(async move {
                    tracing::info!(node_id = %event.node_id, "node disconnected, removing data plane");
                    inner.remove_data_plane_if(&event.node_id, &current).await;
                });
            }));

        Ok(Self {
            inner,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(Error::AlreadyRunning("compute manager"));
        }

        let client = self
            .inner
            .deps
            .client_factory
            .create_client()
            .await
            .context("failed to connect to message bus")?;
        *self.inner.client.write() = Some(client.clone());

        let responder = Responder::new(client.clone(), "orchestrator", subjects::orchestrator_in_ctrl());
        let registered = async {
            responder
                .listen(
                    HandshakeRequest::MESSAGE_TYPE,
                    handler(&self.inner, |inner, message| async move {
                        inner.handle_handshake(message).await
                    }),
                )
                .await?;
            responder
                .listen(
                    HeartbeatRequest::MESSAGE_TYPE,
                    handler(&self.inner, |inner, message| async move {
                        inner.handle_heartbeat(message).await
                    }),
                )
                .await?;
            responder
                .listen(
                    UpdateNodeInfoRequest::MESSAGE_TYPE,
                    handler(&self.inner, |inner, message| async move {
                        inner.handle_update_node_info(message).await
                    }),
                )
                .await?;
            responder
                .listen(
                    ShutdownNoticeRequest::MESSAGE_TYPE,
                    handler(&self.inner, |inner, message| async move {
                        inner.handle_shutdown_notice(message).await
                    }),
                )
                .await
        }
        .await;
        if let Err(e) = registered {
            let _ = responder.close().await;
            self.inner.client.write().take();
            client.close().await;
            return Err(e.context("failed to register control handlers"));
        }

        lifecycle.responder = Some(responder);
        lifecycle.running = true;
        tracing::info!("compute manager started");
        Ok(())
    }

    /// Stop serving and stop every data plane. Waiting for data planes is
    /// bounded by `ctx`. Stopping twice is a no-op.
    pub async fn stop(&self, ctx: &CancellationToken) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }
        lifecycle.running = false;

        let mut errors = Vec::new();
        if let Some(responder) = lifecycle.responder.take() {
            if let Err(e) = responder.close().await {
                errors.push(e.context("failed to close responder"));
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => errors.push(Error::Cancelled),
            _ = self.inner.remove_all_data_planes() => {}
        }

        let client = self.inner.client.write().take();
        if let Some(client) = client {
            client.close().await;
        }
        tracing::info!("compute manager stopped");
        Error::join(errors)
    }

    /// Data plane of a connected node.
    pub fn data_plane(&self, node_id: &str) -> Option<Arc<DataPlane>> {
        self.inner.data_planes.get(node_id).map(|e| e.value().clone())
    }

    pub fn data_plane_count(&self) -> usize {
        self.inner.data_planes.len()
    }
}

/// Wrap a manager method as a request handler.
fn handler<F, Fut>(inner: &Arc<Inner>, f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Arc<Inner>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message>> + Send + 'static,
{
    let inner = inner.clone();
    Arc::new(move |message: Message| f(inner.clone(), message))
}

impl Inner {
    async fn handle_handshake(&self, message: Message) -> Result<Message> {
        let request: HandshakeRequest = message.decode()?;
        let node_id = request.node_info.node_id.clone();
        let response = self.deps.node_manager.handshake(request).await?;
        if let Some(metrics) = &self.deps.metrics {
            metrics.record_handshake(response.accepted);
        }
        if !response.accepted {
            log_handshake_rejected!(node_id = %node_id, reason = %response.reason, "rejected node handshake");
            return Message::from_payload(&response);
        }

        self.replace_data_plane(&node_id, &response)
            .await
            .context("failed to set up data plane")?;

        log_handshake_completed!(
            node_id = %node_id,
            starting_orchestrator_seq_num = response.starting_orchestrator_seq_num,
            last_compute_seq_num = response.last_compute_seq_num,
            "node connected"
        );
        Message::from_payload(&response)
    }

    async fn handle_heartbeat(&self, message: Message) -> Result<Message> {
        let request: HeartbeatRequest = message.decode()?;
        let data_plane = self.require_data_plane(&request.node_id)?;
        let response = self
            .deps
            .node_manager
            .heartbeat(ExtendedHeartbeatRequest {
                last_compute_seq_num: data_plane.get_last_processed_sequence(),
                heartbeat: request,
            })
            .await?;
        Message::from_payload(&response)
    }

    async fn handle_update_node_info(&self, message: Message) -> Result<Message> {
        let request: UpdateNodeInfoRequest = message.decode()?;
        self.require_data_plane(request.node_info.id())?;
        let response = self.deps.node_manager.update_node_info(request).await?;
        Message::from_payload(&response)
    }

    async fn handle_shutdown_notice(&self, message: Message) -> Result<Message> {
        let request: ShutdownNoticeRequest = message.decode()?;
        let node_id = request.node_id.clone();
        let response = self.deps.node_manager.shutdown_notice(request).await?;
        tracing::info!(node_id = %node_id, "node shutting down");
        self.remove_data_plane(&node_id).await;
        Message::from_payload(&response)
    }

    fn require_data_plane(&self, node_id: &str) -> Result<Arc<DataPlane>> {
        self.data_planes
            .get(node_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::HandshakeRequired(node_id.to_string()))
    }

    /// Start a fresh data plane for `node_id`, stopping any previous one first.
    async fn replace_data_plane(&self, node_id: &str, response: &HandshakeResponse) -> Result<()> {
        let client = self.client.read().clone().ok_or(Error::ConnectionClosed)?;
        let _guard = self.swap_lock.lock().await;

        if let Some((_, previous)) = self.data_planes.remove(node_id) {
            tracing::info!(node_id = %node_id, "replacing existing data plane");
            self.stop_data_plane(&previous).await;
        }

        let data_plane = Arc::new(DataPlane::new(DataPlaneConfig {
            node_id: node_id.to_string(),
            client,
            message_handler: self.deps.message_handler.clone(),
            message_creator_factory: self.deps.message_creator_factory.clone(),
            event_store: self.deps.event_store.clone(),
            start_seq_num: response.starting_orchestrator_seq_num,
            last_compute_seq_num: response.last_compute_seq_num,
            dispatcher: self.config.dispatcher.clone(),
            metrics: self.deps.metrics.clone(),
        })?);
        data_plane.start().await?;
        self.data_planes.insert(node_id.to_string(), data_plane);
        if let Some(metrics) = &self.deps.metrics {
            metrics.data_plane_started();
        }
        Ok(())
    }

    async fn remove_data_plane(&self, node_id: &str) {
        let _guard = self.swap_lock.lock().await;
        if let Some((_, data_plane)) = self.data_planes.remove(node_id) {
            self.stop_data_plane(&data_plane).await;
        }
    }

    async fn remove_data_plane_if(&self, node_id: &str, expected: &Arc<DataPlane>) {
        let _guard = self.swap_lock.lock().await;
        let removed = self
            .data_planes
            .remove_if(node_id, |_, current| Arc::ptr_eq(current, expected));
        if let Some((_, data_plane)) = removed {
            self.stop_data_plane(&data_plane).await;
        }
    }

    async fn remove_all_data_planes(&self) {
        let _guard = self.swap_lock.lock().await;
        let node_ids: Vec<String> = self.data_planes.iter().map(|e| e.key().clone()).collect();
        for node_id in node_ids {
            if let Some((_, data_plane)) = self.data_planes.remove(&node_id) {
                self.stop_data_plane(&data_plane).await;
            }
        }
    }

    async fn stop_data_plane(&self, data_plane: &DataPlane) {
        match tokio::time::timeout(self.config.data_plane_stop_timeout, data_plane.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(node_id = %data_plane.node_id(), error = %e, "failed to stop data plane");
            }
            Err(_) => {
                tracing::warn!(
                    node_id = %data_plane.node_id(),
                    timeout = ?self.config.data_plane_stop_timeout,
                    "timed out stopping data plane"
                );
            }
        }
        if let Some(metrics) = &self.deps.metrics {
            metrics.data_plane_stopped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::messages::{
        HeartbeatResponse, ShutdownNoticeResponse, UpdateNodeInfoResponse,
    };
    use crate::models::{NodeInfo, Resources};
    use crate::ncl::{BusPublisher, MessageHandler, Publisher, PublisherConfig};
    use crate::orchestrator::{NodeConnectionHandler, NodeManager};
    use crate::types::{MessageCreator, MessageCreatorFactory};
    use crate::watcher::{Event, InMemoryEventStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct AcceptAll {
        heartbeats: Mutex<Vec<ExtendedHeartbeatRequest>>,
        handlers: Mutex<Vec<NodeConnectionHandler>>,
    }

    impl AcceptAll {
        fn disconnect(&self, node_id: &str) {
            let event = NodeConnectionEvent {
                node_id: node_id.into(),
                previous: NodeConnectionState::Connected,
                current: NodeConnectionState::Disconnected,
                timestamp: Utc::now(),
            };
            for handler in self.handlers.lock().iter() {
                handler(event.clone());
            }
        }
    }

    #[async_trait]
    impl NodeManager for AcceptAll {
        async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
            if request.node_info.node_id == "banned" {
                return Ok(HandshakeResponse::rejected("node is banned"));
            }
            Ok(HandshakeResponse::accepted(request.last_orchestrator_seq_num, 0))
        }

        async fn heartbeat(&self, request: ExtendedHeartbeatRequest) -> Result<HeartbeatResponse> {
            self.heartbeats.lock().push(request);
            Ok(HeartbeatResponse {})
        }

        async fn update_node_info(&self, _request: UpdateNodeInfoRequest) -> Result<UpdateNodeInfoResponse> {
            Ok(UpdateNodeInfoResponse {
                accepted: true,
                reason: String::new(),
            })
        }

        async fn shutdown_notice(&self, _request: ShutdownNoticeRequest) -> Result<ShutdownNoticeResponse> {
            Ok(ShutdownNoticeResponse {})
        }

        fn on_connection_state_change(&self, handler: NodeConnectionHandler) {
            self.handlers.lock().push(handler);
        }
    }

    struct Ignore;

    #[async_trait]
    impl MessageHandler for Ignore {
        async fn handle_message(&self, _message: &Message) -> Result<()> {
            Ok(())
        }
    }

    struct Nothing;

    impl MessageCreator for Nothing {
        fn create_message(&self, _event: &Event) -> Result<Option<Message>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl MessageCreatorFactory for Nothing {
        async fn create_message_creator(&self, _node_id: &str) -> Result<Arc<dyn MessageCreator>> {
            Ok(Arc::new(Nothing))
        }
    }

    async fn manager(bus: &MemoryBus, node_manager: Arc<AcceptAll>) -> ComputeManager {
        let manager = ComputeManager::new(
            Config::default(),
            Dependencies {
                client_factory: Arc::new(bus.clone()),
                node_manager,
                message_handler: Arc::new(Ignore),
                message_creator_factory: Arc::new(Nothing),
                event_store: Arc::new(InMemoryEventStore::new()),
                metrics: None,
            },
        )
        .unwrap();
        manager.start().await.unwrap();
        manager
    }

    fn node(bus: &MemoryBus, node_id: &str) -> BusPublisher {
        BusPublisher::new(
            bus.connect().unwrap(),
            PublisherConfig::new(node_id, subjects::compute_out_ctrl(node_id)),
        )
        .unwrap()
    }

    async fn handshake(publisher: &BusPublisher, node_id: &str) -> Result<HandshakeResponse> {
        let request = HandshakeRequest {
            node_info: NodeInfo {
                node_id: node_id.into(),
                ..Default::default()
            },
            start_time: Utc::now(),
            last_orchestrator_seq_num: 5,
        };
        publisher
            .request(Message::from_payload(&request)?)
            .await?
            .decode()
    }

    fn heartbeat(node_id: &str) -> Message {
        Message::from_payload(&HeartbeatRequest {
            node_id: node_id.into(),
            available_capacity: Resources::default(),
            queue_used_capacity: Resources::default(),
            last_orchestrator_seq_num: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_requires_handshake() {
        let bus = MemoryBus::new();
        let node_manager = Arc::new(AcceptAll::default());
        let manager = manager(&bus, node_manager.clone()).await;
        let publisher = node(&bus, "node-1");

        let err = publisher.request(heartbeat("node-1")).await.unwrap_err();
        assert!(err.is_handshake_required());

        let response = handshake(&publisher, "node-1").await.unwrap();
        assert!(response.accepted);
        assert_eq!(response.starting_orchestrator_seq_num, 5);
        assert!(manager.data_plane("node-1").unwrap().is_running());

        publisher.request(heartbeat("node-1")).await.unwrap();
        assert_eq!(node_manager.heartbeats.lock().len(), 1);

        manager.stop(&CancellationToken::new()).await.unwrap();
        manager.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake_has_no_data_plane() {
        let bus = MemoryBus::new();
        let manager = manager(&bus, Arc::new(AcceptAll::default())).await;

        let response = handshake(&node(&bus, "banned"), "banned").await.unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason, "node is banned");
        assert_eq!(manager.data_plane_count(), 0);
        manager.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown_remove_data_plane() {
        let bus = MemoryBus::new();
        let node_manager = Arc::new(AcceptAll::default());
        let manager = manager(&bus, node_manager.clone()).await;

        let publisher = node(&bus, "node-1");
        handshake(&publisher, "node-1").await.unwrap();
        let first = manager.data_plane("node-1").unwrap();
        node_manager.disconnect("node-1");
        for _ in 0..100 {
            if manager.data_plane_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.data_plane_count(), 0);
        assert!(!first.is_running());

        handshake(&publisher, "node-1").await.unwrap();
        let notice = Message::from_payload(&ShutdownNoticeRequest {
            node_id: "node-1".into(),
            last_orchestrator_seq_num: 5,
        })
        .unwrap();
        publisher.request(notice).await.unwrap();
        assert_eq!(manager.data_plane_count(), 0);

        manager.stop(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_from_foreign_thread_removes_data_plane() {
        let bus = MemoryBus::new();
        let node_manager = Arc::new(AcceptAll::default());
        let manager = manager(&bus, node_manager.clone()).await;
        handshake(&node(&bus, "node-1"), "node-1").await.unwrap();
        assert_eq!(manager.data_plane_count(), 1);

        let notifier = node_manager.clone();
        std::thread::spawn(move || notifier.disconnect("node-1"))
            .join()
            .unwrap();
        for _ in 0..100 {
            if manager.data_plane_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.data_plane_count(), 0);

        manager.stop(&CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn test_new_outside_runtime_is_rejected() {
        let bus = MemoryBus::new();
        let result = ComputeManager::new(
            Config::default(),
            Dependencies {
                client_factory: Arc::new(bus),
                node_manager: Arc::new(AcceptAll::default()),
                message_handler: Arc::new(Ignore),
                message_creator_factory: Arc::new(Nothing),
                event_store: Arc::new(InMemoryEventStore::new()),
                metrics: None,
            },
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
