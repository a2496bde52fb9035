//! Error types for the NCL transport.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by transport components.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A component was started twice.
    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    /// The orchestrator refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A request arrived for a node with no active session.
    #[error("node {0} is not connected, handshake required")]
    HandshakeRequired(String),

    /// The orchestrator refused a node info update.
    #[error("node info update rejected: {0}")]
    NodeInfoRejected(String),

    /// A request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The bus connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The health check found the connection stale.
    #[error("connection unhealthy: {0}")]
    Unhealthy(String),

    /// Bus-level failure (connect, subscribe, publish).
    #[error("bus error: {0}")]
    Bus(String),

    /// An ordered publish could not be delivered or was nacked.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The ordered publisher was reset while the message was pending.
    #[error("publisher reset")]
    PublisherReset,

    /// No acknowledgement arrived within the ack wait.
    #[error("no ack received for message {0}")]
    AckTimeout(String),

    /// Error reported by the remote side of a request.
    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    /// Payload type did not match what the caller expected.
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType {
        expected: &'static str,
        actual: String,
    },

    /// No handler registered for an inbound request type.
    #[error("no handler registered for message type {0}")]
    NoHandler(String),

    /// Event store failure.
    #[error("event store error: {0}")]
    EventStore(String),

    /// Watcher lifecycle failure.
    #[error("watcher {id}: {reason}")]
    Watcher { id: String, reason: String },

    /// Checkpoint store failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Failed to serialize/deserialize data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error annotated with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Several independent failures, e.g. during cleanup.
    #[error("{}", join_messages(.0))]
    Multiple(Vec<Error>),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Stable identifier carried in error replies so the remote side can
    /// reconstruct the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::AlreadyRunning(_) => "AlreadyRunning",
            Error::HandshakeRejected(_) => "HandshakeRejected",
            Error::HandshakeRequired(_) => "HandshakeRequired",
            Error::NodeInfoRejected(_) => "NodeInfoRejected",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled => "Cancelled",
            Error::ConnectionClosed => "ConnectionClosed",
            Error::Unhealthy(_) => "ConnectionUnhealthy",
            Error::Bus(_) => "BusError",
            Error::Publish(_) | Error::PublisherReset | Error::AckTimeout(_) => "PublishError",
            Error::Remote { .. } => "RemoteError",
            Error::UnexpectedMessageType { .. } => "UnexpectedMessageType",
            Error::NoHandler(_) => "NoHandler",
            Error::EventStore(_) | Error::Watcher { .. } | Error::Checkpoint(_) => "InternalError",
            Error::Serialization(_) => "SerializationError",
            Error::Context { source, .. } => source.code(),
            Error::Multiple(_) => "InternalError",
        }
    }

    /// Wrap the error with a description of the failed step.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error means the remote side lost our session.
    pub fn is_handshake_required(&self) -> bool {
        match self {
            Error::HandshakeRequired(_) => true,
            Error::Remote { code, .. } => code == "HandshakeRequired",
            Error::Context { source, .. } => source.is_handshake_required(),
            _ => false,
        }
    }

    /// Collapse a list of errors into a single result.
    pub fn join(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

/// Attach context to a fallible result.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
