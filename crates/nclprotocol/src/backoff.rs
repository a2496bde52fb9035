//! Retry backoff policies.

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Computes how long to wait after a number of consecutive failures.
pub trait Backoff: Send + Sync + fmt::Debug {
    fn backoff_duration(&self, failures: u32) -> Duration;
}

/// Doubles the wait after every failure, up to a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Reconnect backoff of a compute node: 10s doubling up to 2m.
    pub const RECONNECT: ExponentialBackoff = ExponentialBackoff {
        base: Duration::from_secs(10),
        max: Duration::from_secs(120),
    };

    pub fn new(base: Duration, max: Duration) -> Result<Self> {
        if base.is_zero() {
            return Err(Error::InvalidConfig(
                "backoff base interval must be positive".into(),
            ));
        }
        if max < base {
            return Err(Error::InvalidConfig(format!(
                "backoff max interval {max:?} is shorter than base interval {base:?}"
            )));
        }
        Ok(Self { base, max })
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Backoff for ExponentialBackoff {
    fn backoff_duration(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` when the sleep was interrupted.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10)).unwrap();
        assert_eq!(backoff.backoff_duration(0), Duration::ZERO);
        assert_eq!(backoff.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(backoff.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(backoff.backoff_duration(3), Duration::from_secs(4));
        assert_eq!(backoff.backoff_duration(4), Duration::from_secs(8));
        assert_eq!(backoff.backoff_duration(5), Duration::from_secs(10));
        assert_eq!(backoff.backoff_duration(200), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(ExponentialBackoff::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_sleep_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        assert!(sleep_or_cancel(Duration::from_millis(1), &CancellationToken::new()).await);
    }
}
