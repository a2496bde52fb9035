use super::{
    Event, EventFilter, EventHandler, EventIterator, EventStore, GetEventsRequest, RetryStrategy,
    Watcher, WatcherState, WatcherStats,
};
use crate::backoff::sleep_or_cancel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Where to start when no checkpoint is stored for the watcher.
    pub initial_event_iterator: EventIterator,
    pub filter: EventFilter,
    pub batch_size: usize,
    pub retry_strategy: RetryStrategy,
    /// Attempts before a blocked event is skipped; 0 retries forever.
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Upper bound on one wait for new events.
    pub poll_timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            initial_event_iterator: EventIterator::TrimHorizon,
            filter: EventFilter::default(),
            batch_size: 100,
            retry_strategy: RetryStrategy::Block,
            max_retries: 0,
            retry_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl WatchOptions {
    pub fn with_initial_event_iterator(mut self, iterator: EventIterator) -> Self {
        self.initial_event_iterator = iterator;
        self
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

struct State {
    state: WatcherState,
    handler: Option<Arc<dyn EventHandler>>,
    next_iterator: EventIterator,
    checkpoint_iterator: EventIterator,
    last_processed_seq_num: u64,
    last_processed_event_time: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// [`Watcher`] reading from an [`EventStore`].
pub struct EventWatcher {
    id: String,
    store: Arc<dyn EventStore>,
    options: WatchOptions,
    state: Arc<Mutex<State>>,
}

impl EventWatcher {
    /// Create a watcher. A stored checkpoint takes precedence over the
    /// initial iterator.
    pub async fn new(
        id: impl Into<String>,
        store: Arc<dyn EventStore>,
        options: WatchOptions,
    ) -> Result<Self> {
        let id = id.into();
        if options.batch_size == 0 {
            return Err(Error::InvalidConfig("watcher batch size must be positive".into()));
        }

        let start = match store.get_checkpoint(&id).await? {
            Some(seq_num) => EventIterator::AfterSequenceNumber(seq_num),
            None => match options.initial_event_iterator {
                EventIterator::Latest => {
                    EventIterator::AfterSequenceNumber(store.get_latest_event_num().await?)
                }
                EventIterator::TrimHorizon => EventIterator::AfterSequenceNumber(0),
                iterator => iterator,
            },
        };

        tracing::debug!(watcher = %id, start = ?start, "created watcher");

        Ok(Self {
            id,
            store,
            options,
            state: Arc::new(Mutex::new(State {
                state: WatcherState::Idle,
                handler: None,
                next_iterator: start,
                checkpoint_iterator: start,
                last_processed_seq_num: 0,
                last_processed_event_time: None,
                cancel: None,
                task: None,
            })),
        })
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Watcher {
            id: self.id.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Watcher for EventWatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn stats(&self) -> WatcherStats {
        let state = self.state.lock();
        WatcherStats {
            id: self.id.clone(),
            state: state.state,
            next_event_iterator: state.next_iterator,
            checkpoint_iterator: state.checkpoint_iterator,
            last_processed_seq_num: state.last_processed_seq_num,
            last_processed_event_time: state.last_processed_event_time,
        }
    }

    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(state.state, WatcherState::Running | WatcherState::Stopping) {
            return Err(self.error("cannot set handler while running"));
        }
        state.handler = Some(handler);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(state.state, WatcherState::Running | WatcherState::Stopping) {
            return Err(self.error(format!("cannot start watcher in state {:?}", state.state)));
        }
        let handler = state
            .handler
            .clone()
            .ok_or_else(|| self.error("no handler set"))?;

        state.next_iterator = state.checkpoint_iterator;
        state.state = WatcherState::Running;

        let cancel = CancellationToken::new();
        let run = Run {
            id: self.id.clone(),
            store: self.store.clone(),
            options: self.options.clone(),
            handler,
            state: self.state.clone(),
            cancel: cancel.clone(),
        };
        state.cancel = Some(cancel);
        state.task = Some(tokio::spawn(run.run()));

        tracing::debug!(watcher = %self.id, from = ?state.next_iterator, "watcher started");
        Ok(())
    }

    async fn stop(&self) {
        let (cancel, task) = {
            let mut state = self.state.lock();
            if state.state != WatcherState::Running {
                return;
            }
            state.state = WatcherState::Stopping;
            (state.cancel.take(), state.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        self.state.lock().state = WatcherState::Stopped;
        tracing::debug!(watcher = %self.id, "watcher stopped");
    }

    async fn checkpoint(&self, seq_num: u64) -> Result<()> {
        self.store.store_checkpoint(&self.id, seq_num).await?;
        self.state.lock().checkpoint_iterator = EventIterator::AfterSequenceNumber(seq_num);
        Ok(())
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

/// Delivery loop of one watcher run.
struct Run {
    id: String,
    store: Arc<dyn EventStore>,
    options: WatchOptions,
    handler: Arc<dyn EventHandler>,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

impl Run {
    async fn run(self) {
        loop {
            let iterator = self.state.lock().next_iterator;
            let request = GetEventsRequest {
                iterator,
                limit: self.options.batch_size,
                filter: self.options.filter.clone(),
            };
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return,
                response = self.store.get_events(request) => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(watcher = %self.id, error = %e, "failed to read events");
                    if !sleep_or_cancel(self.options.retry_interval, &self.cancel).await {
                        return;
                    }
                    continue;
                }
            };

            if response.events.is_empty() {
                self.state.lock().next_iterator = response.next_iterator;
                let after = response.next_iterator.after_seq_num().unwrap_or_default();
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.store.wait_for_events(after, self.options.poll_timeout) => {}
                }
                continue;
            }

            for event in &response.events {
                if !self.deliver(event).await {
                    return;
                }
                let mut state = self.state.lock();
                state.next_iterator = EventIterator::AfterSequenceNumber(event.seq_num);
                state.last_processed_seq_num = event.seq_num;
                state.last_processed_event_time = Some(event.timestamp);
            }
            self.state.lock().next_iterator = response.next_iterator;
        }
    }

    /// Hand one event to the handler, applying the retry strategy.
    /// Returns false when the watcher was stopped meanwhile.
    async fn deliver(&self, event: &Event) -> bool {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let Err(e) = self.handler.handle_event(event).await else {
                return true;
            };
            attempts += 1;
            match self.options.retry_strategy {
                RetryStrategy::Skip => {
                    tracing::warn!(watcher = %self.id, seq_num = event.seq_num, error = %e, "skipping event after handler failure");
                    return true;
                }
                RetryStrategy::Block => {
                    if self.options.max_retries > 0 && attempts >= self.options.max_retries {
                        tracing::error!(watcher = %self.id, seq_num = event.seq_num, attempts, error = %e, "giving up on event");
                        return true;
                    }
                    tracing::debug!(watcher = %self.id, seq_num = event.seq_num, attempts, error = %e, "retrying event");
                    if !sleep_or_cancel(self.options.retry_interval, &self.cancel).await {
                        return false;
                    }
                }
            }
        }
    }
}
