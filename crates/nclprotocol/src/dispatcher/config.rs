use crate::error::{Error, Result};
use std::time::Duration;

/// Dispatcher timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How often to persist progress; `None` disables checkpointing.
    pub checkpoint_interval: Option<Duration>,
    /// Pending messages with no ack for this long trigger recovery.
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    /// How often pending publish results are polled.
    pub process_interval: Duration,
    /// Bound on restarting the watcher during recovery.
    pub seek_timeout: Duration,
    pub base_retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Some(Duration::from_secs(5)),
            stall_timeout: Duration::from_secs(5 * 60),
            stall_check_interval: Duration::from_secs(30),
            process_interval: Duration::from_millis(100),
            seek_timeout: Duration::from_secs(30),
            base_retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    pub fn without_checkpointing(mut self) -> Self {
        self.checkpoint_interval = None;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_stall_check_interval(mut self, interval: Duration) -> Self {
        self.stall_check_interval = interval;
        self
    }

    pub fn with_process_interval(mut self, interval: Duration) -> Self {
        self.process_interval = interval;
        self
    }

    pub fn with_seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout = timeout;
        self
    }

    pub fn with_retry_intervals(mut self, base: Duration, max: Duration) -> Self {
        self.base_retry_interval = base;
        self.max_retry_interval = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("stall timeout", self.stall_timeout),
            ("stall check interval", self.stall_check_interval),
            ("process interval", self.process_interval),
            ("seek timeout", self.seek_timeout),
            ("base retry interval", self.base_retry_interval),
            ("max retry interval", self.max_retry_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.checkpoint_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidConfig(
                "checkpoint interval must be positive".into(),
            ));
        }
        if self.stall_check_interval >= self.stall_timeout {
            return Err(Error::InvalidConfig(format!(
                "stall check interval {:?} must be shorter than stall timeout {:?}",
                self.stall_check_interval, self.stall_timeout
            )));
        }
        if self.max_retry_interval < self.base_retry_interval {
            return Err(Error::InvalidConfig(format!(
                "max retry interval {:?} is shorter than base retry interval {:?}",
                self.max_retry_interval, self.base_retry_interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        DispatcherConfig::default().validate().unwrap();
        DispatcherConfig::default()
            .without_checkpointing()
            .validate()
            .unwrap();
    }

    #[test]
    fn test_invalid_configs() {
        let zero_process = DispatcherConfig::default().with_process_interval(Duration::ZERO);
        assert!(zero_process.validate().is_err());

        let stall = DispatcherConfig::default()
            .with_stall_timeout(Duration::from_secs(10))
            .with_stall_check_interval(Duration::from_secs(10));
        assert!(stall.validate().is_err());

        let retry = DispatcherConfig::default()
            .with_retry_intervals(Duration::from_secs(10), Duration::from_secs(1));
        assert!(retry.validate().is_err());

        let checkpoint = DispatcherConfig::default().with_checkpoint_interval(Duration::ZERO);
        assert!(checkpoint.validate().is_err());
    }
}
