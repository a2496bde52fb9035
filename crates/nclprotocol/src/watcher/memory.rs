use super::{
    Event, EventIterator, EventStore, GetEventsRequest, GetEventsResponse, Operation,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Event log kept in memory. Sequence numbers start at 1.
#[derive(Debug)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<Event>>,
    checkpoints: Mutex<HashMap<String, u64>>,
    latest: watch::Sender<u64>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            checkpoints: Mutex::new(HashMap::new()),
            latest: watch::channel(0).0,
        }
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return its sequence number.
    pub fn store_event(
        &self,
        operation: Operation,
        object_type: impl Into<String>,
        object: serde_json::Value,
    ) -> u64 {
        let seq_num = {
            let mut events = self.events.write();
            let seq_num = events.len() as u64 + 1;
            events.push(Event {
                seq_num,
                operation,
                object_type: object_type.into(),
                object,
                timestamp: Utc::now(),
            });
            seq_num
        };
        self.latest.send_replace(seq_num);
        seq_num
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get_events(&self, request: GetEventsRequest) -> Result<GetEventsResponse> {
        let events = self.events.read();
        let after = match request.iterator {
            EventIterator::Latest => {
                return Ok(GetEventsResponse {
                    events: Vec::new(),
                    next_iterator: EventIterator::AfterSequenceNumber(events.len() as u64),
                })
            }
            EventIterator::TrimHorizon => 0,
            EventIterator::AfterSequenceNumber(seq) => seq,
        };

        let mut matched = Vec::new();
        let mut last_scanned = after;
        for event in events.iter().skip(after as usize) {
            if matched.len() >= request.limit {
                break;
            }
            last_scanned = event.seq_num;
            if request.filter.matches(event) {
                matched.push(event.clone());
            }
        }

        Ok(GetEventsResponse {
            events: matched,
            next_iterator: EventIterator::AfterSequenceNumber(last_scanned),
        })
    }

    async fn get_latest_event_num(&self) -> Result<u64> {
        Ok(self.events.read().len() as u64)
    }

    async fn store_checkpoint(&self, watcher_id: &str, seq_num: u64) -> Result<()> {
        self.checkpoints
            .lock()
            .insert(watcher_id.to_string(), seq_num);
        Ok(())
    }

    async fn get_checkpoint(&self, watcher_id: &str) -> Result<Option<u64>> {
        Ok(self.checkpoints.lock().get(watcher_id).copied())
    }

    async fn wait_for_events(&self, after_seq_num: u64, timeout: Duration) {
        let mut rx = self.latest.subscribe();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() > after_seq_num {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
    }
}
