//! Prometheus metrics registry for the NCL transport.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Labels for per-node connection state transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub node_id: String,
    pub state: String,
}

/// Labels for request outcomes (heartbeats, node info updates).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub node_id: String,
    pub outcome: String,
}

/// Labels for handshakes as seen by the orchestrator.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HandshakeLabels {
    pub outcome: String,
}

/// Dispatcher labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatcherLabels {
    pub dispatcher: String,
}

/// Metrics registry holding all transport metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Connection metrics
    pub connection_state_transitions_total: Family<StateLabels, Counter>,
    pub heartbeats_total: Family<OutcomeLabels, Counter>,
    pub node_info_updates_total: Family<OutcomeLabels, Counter>,

    // Orchestrator metrics
    pub handshakes_total: Family<HandshakeLabels, Counter>,
    pub connected_nodes: Gauge,

    // Dispatcher metrics
    pub dispatcher_messages_published_total: Family<DispatcherLabels, Counter>,
    pub dispatcher_messages_acked_total: Family<DispatcherLabels, Counter>,
    pub dispatcher_recoveries_total: Family<DispatcherLabels, Counter>,
    pub dispatcher_pending_messages: Family<DispatcherLabels, Gauge>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connection_state_transitions_total = Family::<StateLabels, Counter>::default();
        registry.register(
            "ncl_connection_state_transitions",
            "Total number of connection state transitions",
            connection_state_transitions_total.clone(),
        );

        let heartbeats_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "ncl_heartbeats",
            "Total number of heartbeats sent, by outcome",
            heartbeats_total.clone(),
        );

        let node_info_updates_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "ncl_node_info_updates",
            "Total number of node info updates sent, by outcome",
            node_info_updates_total.clone(),
        );

        let handshakes_total = Family::<HandshakeLabels, Counter>::default();
        registry.register(
            "ncl_handshakes",
            "Total number of handshakes handled, by outcome",
            handshakes_total.clone(),
        );

        let connected_nodes = Gauge::default();
        registry.register(
            "ncl_connected_nodes",
            "Number of compute nodes with an active data plane",
            connected_nodes.clone(),
        );

        let dispatcher_messages_published_total = Family::<DispatcherLabels, Counter>::default();
        registry.register(
            "ncl_dispatcher_messages_published",
            "Total number of messages handed to the ordered publisher",
            dispatcher_messages_published_total.clone(),
        );

        let dispatcher_messages_acked_total = Family::<DispatcherLabels, Counter>::default();
        registry.register(
            "ncl_dispatcher_messages_acked",
            "Total number of published messages acknowledged",
            dispatcher_messages_acked_total.clone(),
        );

        let dispatcher_recoveries_total = Family::<DispatcherLabels, Counter>::default();
        registry.register(
            "ncl_dispatcher_recoveries",
            "Total number of dispatcher recovery episodes",
            dispatcher_recoveries_total.clone(),
        );

        let dispatcher_pending_messages = Family::<DispatcherLabels, Gauge>::default();
        registry.register(
            "ncl_dispatcher_pending_messages",
            "Number of published messages awaiting acknowledgement",
            dispatcher_pending_messages.clone(),
        );

        Self {
            registry,
            connection_state_transitions_total,
            heartbeats_total,
            node_info_updates_total,
            handshakes_total,
            connected_nodes,
            dispatcher_messages_published_total,
            dispatcher_messages_acked_total,
            dispatcher_recoveries_total,
            dispatcher_pending_messages,
        }
    }

    /// Record a connection state transition for a node.
    pub fn record_state_transition(&self, node_id: &str, state: &str) {
        let labels = StateLabels {
            node_id: node_id.to_string(),
            state: state.to_string(),
        };
        self.connection_state_transitions_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record a heartbeat attempt.
    pub fn record_heartbeat(&self, node_id: &str, success: bool) {
        self.heartbeats_total
            .get_or_create(&outcome(node_id, success))
            .inc();
    }

    /// Record a node info update attempt.
    pub fn record_node_info_update(&self, node_id: &str, success: bool) {
        self.node_info_updates_total
            .get_or_create(&outcome(node_id, success))
            .inc();
    }

    /// Record a handshake decision.
    pub fn record_handshake(&self, accepted: bool) {
        let labels = HandshakeLabels {
            outcome: if accepted { "accepted" } else { "rejected" }.to_string(),
        };
        self.handshakes_total.get_or_create(&labels).inc();
    }

    /// A per-node data plane was started.
    pub fn data_plane_started(&self) {
        self.connected_nodes.inc();
    }

    /// A per-node data plane was stopped.
    pub fn data_plane_stopped(&self) {
        self.connected_nodes.dec();
    }

    /// Record a message handed to a dispatcher's publisher.
    pub fn record_published(&self, dispatcher: &str) {
        self.dispatcher_messages_published_total
            .get_or_create(&dispatcher_labels(dispatcher))
            .inc();
    }

    /// Record acknowledged messages.
    pub fn record_acked(&self, dispatcher: &str, count: u64) {
        self.dispatcher_messages_acked_total
            .get_or_create(&dispatcher_labels(dispatcher))
            .inc_by(count);
    }

    /// Record the start of a recovery episode.
    pub fn record_recovery(&self, dispatcher: &str) {
        self.dispatcher_recoveries_total
            .get_or_create(&dispatcher_labels(dispatcher))
            .inc();
    }

    /// Set the number of pending messages for a dispatcher.
    pub fn set_pending(&self, dispatcher: &str, pending: usize) {
        self.dispatcher_pending_messages
            .get_or_create(&dispatcher_labels(dispatcher))
            .set(pending as i64);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome(node_id: &str, success: bool) -> OutcomeLabels {
    OutcomeLabels {
        node_id: node_id.to_string(),
        outcome: if success { "success" } else { "failure" }.to_string(),
    }
}

fn dispatcher_labels(dispatcher: &str) -> DispatcherLabels {
    DispatcherLabels {
        dispatcher: dispatcher.to_string(),
    }
}
