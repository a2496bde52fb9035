//! Reliable, ordered delivery of watched events.
//!
//! The dispatcher turns each event into a message, publishes it through an
//! [`OrderedPublisher`] and tracks the acknowledgement. Progress is persisted
//! as a watcher checkpoint once every earlier message is acknowledged. Publish
//! failures and stalls hand over to recovery, which replays from the last
//! checkpoint.

mod config;
mod recovery;
mod state;

pub use config::DispatcherConfig;
pub use recovery::RecoveryStatus;

use crate::backoff::ExponentialBackoff;
use crate::envelope::KEY_SEQ_NUM;
use crate::error::{Error, Result, ResultExt};
use crate::ncl::OrderedPublisher;
use crate::types::MessageCreator;
use crate::watcher::{Event, EventHandler, Watcher};
use async_trait::async_trait;
use nclprotocol_telemetry::{log_checkpoint_failed, MetricsRegistry};
use parking_lot::Mutex;
use recovery::Recovery;
use state::{DispatcherState, PendingMessage};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of a dispatcher's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub last_observed_seq: u64,
    pub last_acked_seq_num: u64,
    pub last_checkpoint: u64,
    pub pending_messages: usize,
    pub recovery: RecoveryStatus,
}

struct Inner {
    name: String,
    publisher: Arc<dyn OrderedPublisher>,
    watcher: Arc<dyn Watcher>,
    creator: Arc<dyn MessageCreator>,
    config: DispatcherConfig,
    state: Arc<Mutex<DispatcherState>>,
    recovery: Arc<Recovery>,
    metrics: Option<Arc<MetricsRegistry>>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Dispatcher {
    /// Create a dispatcher and install it as the watcher's handler.
    pub fn new(
        publisher: Arc<dyn OrderedPublisher>,
        watcher: Arc<dyn Watcher>,
        creator: Arc<dyn MessageCreator>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        Self::with_metrics(publisher, watcher, creator, config, None)
    }

    pub fn with_metrics(
        publisher: Arc<dyn OrderedPublisher>,
        watcher: Arc<dyn Watcher>,
        creator: Arc<dyn MessageCreator>,
        config: DispatcherConfig,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = ExponentialBackoff::new(config.base_retry_interval, config.max_retry_interval)?;
        let name = watcher.id().to_string();
        let state = Arc::new(Mutex::new(DispatcherState::default()));
        let recovery = Arc::new(Recovery::new(
            name.clone(),
            publisher.clone(),
            watcher.clone(),
            state.clone(),
            backoff,
            config.seek_timeout,
            metrics.clone(),
        ));

        let inner = Arc::new(Inner {
            name,
            publisher,
            watcher,
            creator,
            config,
            state,
            recovery,
            metrics,
        });
        inner
            .watcher
            .set_handler(Arc::new(EventDispatch(Arc::downgrade(&inner))))
            .context("failed to set watcher handler")?;

        Ok(Self {
            inner,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(Error::AlreadyRunning("dispatcher"));
        }
        self.inner
            .watcher
            .start()
            .await
            .context("failed to start watcher")?;

        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(
            self.inner.clone().process_loop(cancel.clone()),
        )];
        if let Some(interval) = self.inner.config.checkpoint_interval {
            tasks.push(tokio::spawn(
                self.inner.clone().checkpoint_loop(interval, cancel.clone()),
            ));
        }
        tasks.push(tokio::spawn(self.inner.clone().stall_loop(cancel.clone())));

        lifecycle.running = true;
        lifecycle.cancel = Some(cancel);
        lifecycle.tasks = tasks;
        tracing::debug!(dispatcher = %self.inner.name, "dispatcher started");
        Ok(())
    }

    /// Stop dispatching. A final checkpoint is attempted when checkpointing
    /// is enabled. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }
        lifecycle.running = false;

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        for task in lifecycle.tasks.drain(..) {
            let _ = task.await;
        }
        self.inner.recovery.stop().await;
        self.inner.watcher.stop().await;

        if self.inner.config.checkpoint_interval.is_some() {
            self.inner.checkpoint().await;
        }
        self.inner.recovery.reset();
        tracing::debug!(dispatcher = %self.inner.name, "dispatcher stopped");
        Ok(())
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.state.lock();
        DispatcherStats {
            last_observed_seq: state.last_observed_seq,
            last_acked_seq_num: state.last_acked_seq_num,
            last_checkpoint: state.last_checkpoint,
            pending_messages: state.pending.len(),
            recovery: self.inner.recovery.status(),
        }
    }
}

impl Inner {
    async fn process_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.process_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.process_pending(&cancel).await,
            }
        }
    }

    /// Poll pending publishes in order. Acks release everything up to the
    /// acknowledged sequence number; the first failure goes to recovery.
    async fn process_pending(&self, cancel: &CancellationToken) {
        let (released, failure, pending) = {
            let mut state = self.state.lock();
            let mut acked = None;
            let mut failure = None;
            for message in state.pending.iter_mut() {
                match message.future.try_result() {
                    None => continue,
                    Some(Ok(())) => acked = Some(message.event_seq_num),
                    Some(Err(e)) => {
                        failure = Some((message.event_seq_num, e));
                        break;
                    }
                }
            }
            let released = acked.map_or(0, |seq_num| state.update_last_acked(seq_num));
            (released, failure, state.pending.len())
        };

        if released > 0 {
            self.recovery.record_progress();
        }
        if let Some(metrics) = &self.metrics {
            if released > 0 {
                metrics.record_acked(&self.name, released as u64);
            }
            metrics.set_pending(&self.name, pending);
        }
        if let Some((seq_num, err)) = failure {
            self.recovery.handle_error(cancel, seq_num, err).await;
        }
    }

    async fn checkpoint_loop(self: Arc<Self>, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.checkpoint().await,
            }
        }
    }

    async fn checkpoint(&self) {
        let seq_num = self.state.lock().get_checkpoint_seq_num();
        if seq_num == 0 {
            return;
        }
        match self.watcher.checkpoint(seq_num).await {
            Ok(()) => {
                self.state.lock().update_last_checkpoint(seq_num);
                tracing::trace!(dispatcher = %self.name, seq_num, "checkpointed");
            }
            Err(e) => {
                log_checkpoint_failed!(dispatcher = %self.name, seq_num, error = %e, "failed to checkpoint dispatcher progress");
            }
        }
    }

    async fn stall_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.stall_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let stalled = {
                let state = self.state.lock();
                if state.is_stalled(self.config.stall_timeout) {
                    state.pending.oldest().map(|m| m.event_seq_num)
                } else {
                    None
                }
            };
            if let Some(seq_num) = stalled {
                let err = Error::Publish(format!(
                    "no acknowledgement within {:?}",
                    self.config.stall_timeout
                ));
                self.recovery.handle_error(&cancel, seq_num, err).await;
            }
        }
    }
}

/// Watcher handler feeding events into the dispatcher.
struct EventDispatch(Weak<Inner>);

#[async_trait]
impl EventHandler for EventDispatch {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let Some(inner) = self.0.upgrade() else {
            return Err(Error::Publish("dispatcher dropped".into()));
        };
        let Some(message) = inner.creator.create_message(event)? else {
            inner.state.lock().update_last_observed(event.seq_num);
            return Ok(());
        };

        let message = message.with_metadata(KEY_SEQ_NUM, event.seq_num);
        let future = inner.publisher.publish_async(message).await?;
        {
            let mut state = inner.state.lock();
            state.pending.add(PendingMessage {
                event_seq_num: event.seq_num,
                publish_time: Instant::now(),
                future,
            });
            state.update_last_observed(event.seq_num);
        }
        if let Some(metrics) = &inner.metrics {
            metrics.record_published(&inner.name);
        }
        Ok(())
    }
}
