//! Ordered, replayable consumption of store events.
//!
//! An [`EventStore`] is an append-only log with monotonically increasing
//! sequence numbers. A [`Watcher`] reads it from a starting point, hands each
//! matching event to an [`EventHandler`] and remembers a checkpoint to resume
//! from after a restart.

mod event_watcher;
mod memory;

pub use event_watcher::{EventWatcher, WatchOptions};
pub use memory::InMemoryEventStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Object type of execution create/update events.
pub const EVENT_OBJECT_EXECUTION_UPSERT: &str = "ExecutionUpsert";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One entry of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq_num: u64,
    pub operation: Operation,
    pub object_type: String,
    pub object: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Position in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIterator {
    /// Before the oldest event.
    TrimHorizon,
    /// After the newest event at the time of resolution.
    Latest,
    /// After the event with this sequence number.
    AfterSequenceNumber(u64),
}

impl EventIterator {
    /// Sequence number this iterator resumes after, if fixed.
    pub fn after_seq_num(&self) -> Option<u64> {
        match self {
            EventIterator::TrimHorizon => Some(0),
            EventIterator::Latest => None,
            EventIterator::AfterSequenceNumber(seq) => Some(*seq),
        }
    }
}

/// Restricts which events a watcher receives. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub object_types: Vec<String>,
    pub operations: Vec<Operation>,
}

impl EventFilter {
    pub fn object_types(types: &[&str]) -> Self {
        Self {
            object_types: types.iter().map(|t| t.to_string()).collect(),
            operations: Vec::new(),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        (self.object_types.is_empty() || self.object_types.contains(&event.object_type))
            && (self.operations.is_empty() || self.operations.contains(&event.operation))
    }
}

#[derive(Debug, Clone)]
pub struct GetEventsRequest {
    pub iterator: EventIterator,
    pub limit: usize,
    pub filter: EventFilter,
}

#[derive(Debug, Clone)]
pub struct GetEventsResponse {
    pub events: Vec<Event>,
    /// Where the next read should resume; may be past the last returned
    /// event when filtered events were skipped.
    pub next_iterator: EventIterator,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_events(&self, request: GetEventsRequest) -> Result<GetEventsResponse>;

    async fn get_latest_event_num(&self) -> Result<u64>;

    async fn store_checkpoint(&self, watcher_id: &str, seq_num: u64) -> Result<()>;

    async fn get_checkpoint(&self, watcher_id: &str) -> Result<Option<u64>>;

    /// Resolve once an event newer than `after_seq_num` exists or `timeout` elapses.
    async fn wait_for_events(&self, after_seq_num: u64, timeout: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// What to do when the handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry the same event until it succeeds or the watcher stops.
    Block,
    /// Log and move on to the next event.
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatcherStats {
    pub id: String,
    pub state: WatcherState,
    pub next_event_iterator: EventIterator,
    pub checkpoint_iterator: EventIterator,
    pub last_processed_seq_num: u64,
    pub last_processed_event_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<()>;
}

#[async_trait]
pub trait Watcher: Send + Sync {
    fn id(&self) -> &str;

    fn stats(&self) -> WatcherStats;

    /// Install the handler. Not allowed while running.
    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<()>;

    /// Start delivering from the checkpoint iterator.
    async fn start(&self) -> Result<()>;

    /// Stop delivering and wait for the delivery task. No-op unless running.
    async fn stop(&self);

    /// Persist `seq_num` as the restart point.
    async fn checkpoint(&self, seq_num: u64) -> Result<()>;
}
