//! Compute node side of the transport.

mod config;
mod control_plane;
mod data_plane;
mod health;
mod manager;

pub use config::{Config, Dependencies};
pub use control_plane::{ControlPlane, ControlPlaneConfig};
pub use data_plane::{DataPlane, DataPlaneConfig, COMPUTE_DISPATCHER_ID};
pub use health::HealthTracker;
pub use manager::ConnectionManager;
