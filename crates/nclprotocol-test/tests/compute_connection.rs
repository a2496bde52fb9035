//! Connection lifecycle of a compute node against a live orchestrator.

use nclprotocol::bus::MemoryBus;
use nclprotocol::{ConnectionState, Error};
use nclprotocol_test::{eventually, MockCheckpointer, TestNode, TestOrchestrator};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_handshake_resumes_from_checkpoint() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let checkpointer = Arc::new(MockCheckpointer::new().with_checkpoint("incoming-node-1", 124));
    let node = TestNode::start_with(&bus, TestNode::fast_config("node-1"), checkpointer)
        .await
        .unwrap();

    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();
    let handshakes = orchestrator.node_manager.handshakes();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0].last_orchestrator_seq_num, 124);
    assert_eq!(handshakes[0].node_info.node_id, "node-1");

    eventually(WAIT, "a heartbeat", || {
        !orchestrator.node_manager.heartbeats().is_empty()
    })
    .await
    .unwrap();
    let heartbeat = &orchestrator.node_manager.heartbeats()[0];
    assert_eq!(heartbeat.heartbeat.node_id, "node-1");
    assert_eq!(heartbeat.heartbeat.last_orchestrator_seq_num, 124);

    let health = node.manager.get_health();
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.connected_since.is_some());
    assert!(health.last_error.is_none());

    node.close().await.unwrap();
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_handshake_keeps_retrying() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    orchestrator.node_manager.set_reject(Some("maintenance window"));

    let node = TestNode::start(&bus, "node-1").await.unwrap();
    eventually(WAIT, "two handshake attempts", || {
        orchestrator.node_manager.handshakes().len() >= 2
    })
    .await
    .unwrap();
    assert_ne!(node.state(), ConnectionState::Connected);
    let health = node.manager.get_health();
    assert!(health.consecutive_failures >= 1);
    assert!(health
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("maintenance window")));
    assert_eq!(orchestrator.manager.data_plane_count(), 0);

    orchestrator.node_manager.set_reject(None);
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();
    assert_eq!(node.manager.get_health().consecutive_failures, 0);
    assert_eq!(orchestrator.manager.data_plane_count(), 1);

    node.close().await.unwrap();
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_handshake_required_forces_reconnect() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    orchestrator.node_manager.set_require_handshake(true);
    eventually(WAIT, "the node to drop the session", || {
        node.observed_states()
            .iter()
            .skip_while(|s| **s != ConnectionState::Connected)
            .any(|s| *s == ConnectionState::Disconnected)
    })
    .await
    .unwrap();
    orchestrator.node_manager.set_require_handshake(false);

    eventually(WAIT, "a second handshake", || {
        orchestrator.node_manager.handshakes().len() >= 2
    })
    .await
    .unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();
    assert!(!node.manager.get_health().handshake_required);
    assert_eq!(orchestrator.manager.data_plane_count(), 1);

    node.close().await.unwrap();
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_missed_heartbeats_disconnect_until_orchestrator_returns() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    orchestrator.stop().await.unwrap();
    eventually(WAIT, "the node to notice missing heartbeats", || {
        node.observed_states()
            .iter()
            .skip_while(|s| **s != ConnectionState::Connected)
            .any(|s| *s == ConnectionState::Disconnected)
    })
    .await
    .unwrap();
    let health = node.manager.get_health();
    assert!(health.consecutive_failures >= 1);
    assert!(health.last_error.is_some());

    orchestrator.manager.start().await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    node.close().await.unwrap();
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_close_sends_shutdown_notice_once() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    node.close().await.unwrap();
    node.close().await.unwrap();
    assert_eq!(node.state(), ConnectionState::Disconnected);

    let notices = orchestrator.node_manager.shutdown_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].node_id, "node-1");
    eventually(WAIT, "the data plane to stop", || {
        orchestrator.manager.data_plane_count() == 0
    })
    .await
    .unwrap();
    assert!(!orchestrator.node_manager.is_connected("node-1"));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_info_sent_only_when_static_config_changes() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    // Live capacity is not static config.
    node.node_info
        .update(|info| info.compute_node_info.running_executions = 3);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(orchestrator.node_manager.node_info_updates().is_empty());

    node.node_info.update(|info| {
        info.labels.insert("zone".into(), "eu-west".into());
    });
    eventually(WAIT, "a node info update", || {
        orchestrator.node_manager.node_info_updates().len() == 1
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let updates = orchestrator.node_manager.node_info_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].node_info.labels.get("zone").map(String::as_str),
        Some("eu-west")
    );

    node.close().await.unwrap();
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_state_observers_see_connect_sequence() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    eventually(WAIT, "observers to see Connected", || {
        node.observed_states().contains(&ConnectionState::Connected)
    })
    .await
    .unwrap();
    assert_eq!(
        node.observed_states(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    node.close().await.unwrap();
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_close_delivers_disconnect_to_observers() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    node.close().await.unwrap();
    assert_eq!(
        node.observed_states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let node = TestNode::start(&bus, "node-1").await.unwrap();
    node.wait_for_state(ConnectionState::Connected, WAIT).await.unwrap();

    assert!(matches!(
        node.manager.start().await,
        Err(Error::AlreadyRunning("connection manager"))
    ));
    assert_eq!(node.state(), ConnectionState::Connected);
    assert_eq!(orchestrator.node_manager.handshakes().len(), 1);

    node.close().await.unwrap();
    node.close().await.unwrap();
    assert_eq!(node.state(), ConnectionState::Disconnected);
    assert_eq!(orchestrator.node_manager.shutdown_notices().len(), 1);

    orchestrator.stop().await.unwrap();
}
