//! Recovery from publish failures.
//!
//! Recovery stops the watcher, drops everything pending and restarts the
//! watcher from its last checkpoint after a backoff. Events between the
//! checkpoint and the failure are published again.

use super::state::DispatcherState;
use crate::backoff::{sleep_or_cancel, Backoff, ExponentialBackoff};
use crate::error::Error;
use crate::ncl::OrderedPublisher;
use crate::watcher::{Watcher, WatcherState};
use nclprotocol_telemetry::{log_dispatcher_recovery, MetricsRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Snapshot of a dispatcher's recovery, reported in
/// [`DispatcherStats`](super::DispatcherStats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStatus {
    /// A recovery task is backing off or restarting the watcher.
    pub is_recovering: bool,
    /// When the most recent publish failure was seen.
    pub last_failure: Option<Instant>,
    /// Failures since messages last flowed; drives the backoff.
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct RecoveryState {
    is_recovering: bool,
    last_failure: Option<Instant>,
    failures: u32,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Restarts a dispatcher's watcher after publish failures, one recovery at a
/// time, with exponential backoff between attempts.
pub(crate) struct Recovery {
    name: String,
    publisher: Arc<dyn OrderedPublisher>,
    watcher: Arc<dyn Watcher>,
    state: Arc<Mutex<DispatcherState>>,
    backoff: ExponentialBackoff,
    seek_timeout: Duration,
    metrics: Option<Arc<MetricsRegistry>>,
    inner: Mutex<RecoveryState>,
}

impl Recovery {
    pub fn new(
        name: String,
        publisher: Arc<dyn OrderedPublisher>,
        watcher: Arc<dyn Watcher>,
        state: Arc<Mutex<DispatcherState>>,
        backoff: ExponentialBackoff,
        seek_timeout: Duration,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            name,
            publisher,
            watcher,
            state,
            backoff,
            seek_timeout,
            metrics,
            inner: Mutex::new(RecoveryState::default()),
        }
    }

    /// React to a failed publish of `seq_num`.
    pub async fn handle_error(self: &Arc<Self>, parent: &CancellationToken, seq_num: u64, err: Error) {
        let failures = {
            let mut inner = self.inner.lock();
            if inner.is_recovering {
                tracing::debug!(dispatcher = %self.name, seq_num, error = %err, "already recovering, ignoring error");
                return;
            }
            inner.is_recovering = true;
            inner.failures += 1;
            inner.last_failure = Some(Instant::now());
            inner.failures
        };

        log_dispatcher_recovery!(
            dispatcher = %self.name,
            seq_num,
            failures,
            error = %err,
            "publish failed, starting recovery"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_recovery(&self.name);
        }

        self.watcher.stop().await;
        self.publisher.reset().await;
        self.state.lock().reset();

        let cancel = parent.child_token();
        let task = tokio::spawn(self.clone().recovery_loop(cancel.clone()));
        let mut inner = self.inner.lock();
        inner.cancel = Some(cancel);
        inner.task = Some(task);
    }

    async fn recovery_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let failures = self.inner.lock().failures;
            let wait = self.backoff.backoff_duration(failures);
            if !sleep_or_cancel(wait, &cancel).await || cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.seek_timeout, self.watcher.start()) => result,
            };
            match result {
                Ok(Ok(())) => {
                    tracing::info!(dispatcher = %self.name, failures, "recovered, watcher restarted from checkpoint");
                    break;
                }
                Ok(Err(e)) => {
                    if self.watcher.stats().state == WatcherState::Running {
                        tracing::debug!(dispatcher = %self.name, "watcher already running, ending recovery");
                        break;
                    }
                    tracing::warn!(dispatcher = %self.name, failures, error = %e, "failed to restart watcher");
                }
                Err(_) => {
                    tracing::warn!(dispatcher = %self.name, timeout = ?self.seek_timeout, "timed out restarting watcher");
                }
            }

            let mut inner = self.inner.lock();
            inner.failures += 1;
            inner.last_failure = Some(Instant::now());
        }
        self.inner.lock().is_recovering = false;
    }

    /// Messages are flowing again; the next failure starts a fresh backoff.
    pub fn record_progress(&self) {
        let mut inner = self.inner.lock();
        if !inner.is_recovering {
            inner.failures = 0;
        }
    }

    /// Current recovery snapshot.
    pub fn status(&self) -> RecoveryStatus {
        let inner = self.inner.lock();
        RecoveryStatus {
            is_recovering: inner.is_recovering,
            last_failure: inner.last_failure,
            consecutive_failures: inner.failures,
        }
    }

    /// Interrupt an ongoing recovery and wait for it. Safe to call repeatedly.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut inner = self.inner.lock();
            (inner.cancel.take(), inner.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Forget past failures. Does not interrupt a running recovery; use
    /// [`stop`](Self::stop) for that.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.is_recovering = false;
        inner.last_failure = None;
        inner.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::ncl::PubFuture;
    use crate::envelope::Message;
    use crate::watcher::{EventHandler, EventIterator, WatcherStats};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakePublisher {
        resets: AtomicU32,
    }

    #[async_trait]
    impl OrderedPublisher for FakePublisher {
        async fn publish_async(&self, _message: Message) -> Result<PubFuture> {
            Err(Error::Publish("unused".into()))
        }
        async fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeWatcher {
        state: Mutex<WatcherState>,
        start_failures: AtomicU32,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl FakeWatcher {
        fn new(start_failures: u32) -> Self {
            Self {
                state: Mutex::new(WatcherState::Running),
                start_failures: AtomicU32::new(start_failures),
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Watcher for FakeWatcher {
        fn id(&self) -> &str {
            "fake"
        }
        fn stats(&self) -> WatcherStats {
            WatcherStats {
                id: "fake".into(),
                state: *self.state.lock(),
                next_event_iterator: EventIterator::TrimHorizon,
                checkpoint_iterator: EventIterator::TrimHorizon,
                last_processed_seq_num: 0,
                last_processed_event_time: None,
            }
        }
        fn set_handler(&self, _handler: Arc<dyn EventHandler>) -> Result<()> {
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.start_failures.load(Ordering::SeqCst) > 0 {
                self.start_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::EventStore("unavailable".into()));
            }
            *self.state.lock() = WatcherState::Running;
            Ok(())
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = WatcherState::Stopped;
        }
        async fn checkpoint(&self, _seq_num: u64) -> Result<()> {
            Ok(())
        }
    }

    fn recovery(watcher: Arc<FakeWatcher>, publisher: Arc<FakePublisher>) -> Arc<Recovery> {
        Arc::new(Recovery::new(
            "test".into(),
            publisher,
            watcher,
            Arc::new(Mutex::new(DispatcherState::default())),
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(20)).unwrap(),
            Duration::from_secs(1),
            None,
        ))
    }

    async fn wait_until_recovered(recovery: &Recovery) {
        for _ in 0..200 {
            if !recovery.status().is_recovering {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("recovery did not finish");
    }

    #[tokio::test]
    async fn test_recovery_restarts_watcher() {
        let watcher = Arc::new(FakeWatcher::new(2));
        let publisher = Arc::new(FakePublisher::default());
        let recovery = recovery(watcher.clone(), publisher.clone());
        let cancel = CancellationToken::new();

        recovery
            .handle_error(&cancel, 11, Error::Publish("nack".into()))
            .await;
        assert!(recovery.status().is_recovering);

        // A second error during recovery is ignored.
        recovery
            .handle_error(&cancel, 12, Error::Publish("nack".into()))
            .await;
        assert_eq!(publisher.resets.load(Ordering::SeqCst), 1);

        wait_until_recovered(&recovery).await;
        assert_eq!(watcher.stops.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.starts.load(Ordering::SeqCst), 3);
        assert_eq!(recovery.status().consecutive_failures, 3);

        recovery.record_progress();
        assert_eq!(recovery.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_recovery() {
        let watcher = Arc::new(FakeWatcher::new(u32::MAX));
        let recovery = recovery(watcher.clone(), Arc::new(FakePublisher::default()));
        let cancel = CancellationToken::new();

        recovery
            .handle_error(&cancel, 1, Error::AckTimeout("m".into()))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        recovery.stop().await;
        recovery.stop().await;

        assert!(!recovery.status().is_recovering);
        recovery.reset();
        assert_eq!(recovery.status().consecutive_failures, 0);
    }
}
