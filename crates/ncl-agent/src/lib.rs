//! Building blocks of the `ncl-agent` binary.

pub mod checkpoint;
pub mod node;
pub mod node_manager;

pub use checkpoint::FileCheckpointer;
pub use node::{
    parse_labels, LoggingMessageHandler, NoopLogStreamServer, PassthroughMessageCreator,
    StaticNodeInfoProvider,
};
pub use node_manager::InMemoryNodeManager;
