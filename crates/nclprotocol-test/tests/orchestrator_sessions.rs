//! Orchestrator session handling driven by a hand-rolled node.

use chrono::Utc;
use nclprotocol::bus::MemoryBus;
use nclprotocol::messages::{HandshakeRequest, HandshakeResponse, HeartbeatRequest};
use nclprotocol::models::Resources;
use nclprotocol::ncl::{BusPublisher, Publisher, PublisherConfig};
use nclprotocol::{subjects, Message, NodeInfo};
use nclprotocol_test::{eventually, TestOrchestrator};
use std::time::Duration;

fn control_publisher(bus: &MemoryBus, node_id: &str) -> BusPublisher {
    BusPublisher::new(
        bus.connect().unwrap(),
        PublisherConfig::new(node_id, subjects::compute_out_ctrl(node_id)),
    )
    .unwrap()
}

async fn handshake(publisher: &BusPublisher, node_id: &str, last_seq: u64) -> HandshakeResponse {
    let request = HandshakeRequest {
        node_info: NodeInfo {
            node_id: node_id.into(),
            ..Default::default()
        },
        start_time: Utc::now(),
        last_orchestrator_seq_num: last_seq,
    };
    publisher
        .request(Message::from_payload(&request).unwrap())
        .await
        .unwrap()
        .decode()
        .unwrap()
}

#[tokio::test]
async fn test_repeated_handshake_replaces_data_plane() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let publisher = control_publisher(&bus, "node-1");

    let response = handshake(&publisher, "node-1", 0).await;
    assert!(response.accepted);
    let first = orchestrator.manager.data_plane("node-1").unwrap();

    let response = handshake(&publisher, "node-1", 7).await;
    assert!(response.accepted);
    assert_eq!(response.starting_orchestrator_seq_num, 7);
    let second = orchestrator.manager.data_plane("node-1").unwrap();

    assert_eq!(orchestrator.manager.data_plane_count(), 1);
    assert!(!first.is_running());
    assert!(second.is_running());
    // One subscriber on the node's outbound subject, owned by the new plane.
    assert_eq!(bus.subscriber_count(&subjects::compute_out_msgs("node-1")), 1);

    orchestrator.stop().await.unwrap();
    assert!(!second.is_running());
    assert_eq!(orchestrator.manager.data_plane_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_from_unknown_node_requires_handshake() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let publisher = control_publisher(&bus, "node-9");

    let heartbeat = Message::from_payload(&HeartbeatRequest {
        node_id: "node-9".into(),
        available_capacity: Resources::default(),
        queue_used_capacity: Resources::default(),
        last_orchestrator_seq_num: 0,
    })
    .unwrap();
    let err = publisher.request(heartbeat).await.unwrap_err();
    assert!(err.is_handshake_required());
    assert!(orchestrator.node_manager.heartbeats().is_empty());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_event_stops_data_plane() {
    let bus = MemoryBus::new();
    let orchestrator = TestOrchestrator::start(&bus).await.unwrap();
    let publisher = control_publisher(&bus, "node-1");

    handshake(&publisher, "node-1", 0).await;
    let data_plane = orchestrator.manager.data_plane("node-1").unwrap();
    orchestrator.node_manager.disconnect("node-1");

    eventually(Duration::from_secs(5), "data plane removal", || {
        orchestrator.manager.data_plane_count() == 0
    })
    .await
    .unwrap();
    assert!(!data_plane.is_running());

    orchestrator.stop().await.unwrap();
}
