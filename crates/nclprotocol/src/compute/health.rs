use crate::error::Error;
use crate::types::{ConnectionHealth, ConnectionState};
use chrono::Utc;
use parking_lot::RwLock;

/// Tracks the health of a compute node's connection.
#[derive(Debug)]
pub struct HealthTracker {
    health: RwLock<ConnectionHealth>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self {
            health: RwLock::new(ConnectionHealth {
                start_time: Utc::now(),
                last_successful_heartbeat: None,
                last_successful_update: None,
                current_state: ConnectionState::Disconnected,
                consecutive_failures: 0,
                last_error: None,
                connected_since: None,
                handshake_required: false,
            }),
        }
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connecting(&self) {
        self.health.write().current_state = ConnectionState::Connecting;
    }

    /// A handshake succeeded. Counts as a heartbeat.
    pub fn mark_connected(&self) {
        let now = Utc::now();
        let mut health = self.health.write();
        health.current_state = ConnectionState::Connected;
        health.connected_since = Some(now);
        health.last_successful_heartbeat = Some(now);
        health.consecutive_failures = 0;
        health.last_error = None;
        health.handshake_required = false;
    }

    /// The connection was lost or an attempt failed. Failures count towards
    /// the reconnect backoff.
    pub fn mark_disconnected(&self, err: Option<&Error>) {
        let mut health = self.health.write();
        health.current_state = ConnectionState::Disconnected;
        health.connected_since = None;
        if let Some(err) = err {
            health.last_error = Some(err.to_string());
            health.consecutive_failures += 1;
        }
    }

    pub fn heartbeat_success(&self) {
        self.health.write().last_successful_heartbeat = Some(Utc::now());
    }

    pub fn update_success(&self) {
        self.health.write().last_successful_update = Some(Utc::now());
    }

    /// The orchestrator no longer knows this node.
    pub fn handshake_required(&self) {
        self.health.write().handshake_required = true;
    }

    pub fn get_state(&self) -> ConnectionState {
        self.health.read().current_state
    }

    pub fn get_health(&self) -> ConnectionHealth {
        self.health.read().clone()
    }
}
