//! Global `tracing` subscriber setup.
//!
//! Transport code logs through the `log_*!` macros below so every line
//! carries an `event` field drawn from [`events`].

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            TelemetryError::LoggingInit(format!("invalid log level {:?}: {e}", config.log_level))
        })?,
    };

    let layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Standard log event names.
pub mod events {
    /// Process is starting up.
    pub const STARTUP: &str = "startup";

    /// Process is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// A connection moved between Disconnected, Connecting and Connected.
    pub const CONNECTION_STATE_CHANGED: &str = "connection_state_changed";

    /// A handshake was accepted.
    pub const HANDSHAKE_COMPLETED: &str = "handshake_completed";

    /// A handshake was rejected.
    pub const HANDSHAKE_REJECTED: &str = "handshake_rejected";

    /// A heartbeat could not be delivered.
    pub const HEARTBEAT_FAILED: &str = "heartbeat_failed";

    /// A dispatcher entered recovery after a publish failure.
    pub const DISPATCHER_RECOVERY: &str = "dispatcher_recovery";

    /// A checkpoint could not be persisted.
    pub const CHECKPOINT_FAILED: &str = "checkpoint_failed";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_connection_state_changed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::CONNECTION_STATE_CHANGED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_handshake_completed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::HANDSHAKE_COMPLETED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_handshake_rejected {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::HANDSHAKE_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_heartbeat_failed {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::HEARTBEAT_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_dispatcher_recovery {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::DISPATCHER_RECOVERY,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_checkpoint_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::CHECKPOINT_FAILED,
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // Logging can only be initialized once per process, so these tests
    // cover the configuration logic only.

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("PRETTY"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("invalid"), None);
    }

    #[test]
    fn test_event_names_are_snake_case() {
        for name in [
            events::STARTUP,
            events::CONNECTION_STATE_CHANGED,
            events::DISPATCHER_RECOVERY,
            events::CHECKPOINT_FAILED,
        ] {
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
