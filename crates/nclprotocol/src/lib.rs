//! Reliable node-to-orchestrator transport for Bacalhau.
//!
//! A compute node and the orchestrator exchange two kinds of traffic over a
//! subject-addressed message bus:
//!
//! - control requests (handshake, heartbeat, node info updates, shutdown
//!   notice), sent by the node through [`compute::ControlPlane`] and served by
//!   [`orchestrator::ComputeManager`];
//! - ordered, sequence-numbered data messages, produced from a local event
//!   log by a [`dispatcher::Dispatcher`] on each side and acknowledged by the
//!   receiving side.
//!
//! [`compute::ConnectionManager`] owns the node's session: it connects,
//! handshakes, watches health and reconnects with backoff. Sequence numbers
//! processed on both sides are exchanged in the handshake so a reconnecting
//! node resumes without loss or duplication.
//!
//! # Usage
//!
//! ```ignore
//! use nclprotocol::compute::{Config, ConnectionManager, Dependencies};
//!
//! let manager = ConnectionManager::new(Config::new("node-1"), deps)?;
//! manager.start().await?;
//! ```

pub mod backoff;
pub mod bus;
pub mod compute;
pub mod dispatcher;
pub mod envelope;
mod error;
pub mod logstream;
pub mod messages;
pub mod models;
pub mod ncl;
pub mod orchestrator;
pub mod seq_tracker;
pub mod subjects;
pub mod types;
pub mod watcher;

pub use backoff::{Backoff, ExponentialBackoff};
pub use envelope::Message;
pub use error::{Error, Result, ResultExt};
pub use messages::Payload;
pub use models::NodeInfo;
pub use seq_tracker::SequenceTracker;
pub use types::{
    Checkpointer, ConnectionHealth, ConnectionState, ConnectionStateHandler, MessageCreator,
    MessageCreatorFactory, NodeInfoProvider,
};
