//! Test harnesses for the NCL transport.
//!
//! Provides mock implementations of the capabilities the transport consumes,
//! plus `TestOrchestrator` and `TestNode`, which wire a real
//! [`ComputeManager`](nclprotocol::orchestrator::ComputeManager) and
//! [`ConnectionManager`](nclprotocol::compute::ConnectionManager) to an
//! in-memory bus.

pub mod harness;
pub mod mocks;

pub use harness::{eventually, TestError, TestNode, TestOrchestrator};
pub use mocks::{
    MockCheckpointer, MockLogStreamServer, MockMessageCreator, MockMessageHandler,
    MockNodeInfoProvider, MockNodeManager,
};
