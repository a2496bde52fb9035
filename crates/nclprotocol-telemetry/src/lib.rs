//! Logging and metrics for the NCL transport.
//!
//! [`Telemetry::init`] installs the global `tracing` subscriber and creates
//! the [`MetricsRegistry`] shared by the connection managers, dispatchers
//! and the orchestrator. Transport code logs through the `log_*!` macros so
//! every line carries a stable `event` field.
//!
//! ```ignore
//! use nclprotocol_telemetry::{LogFormat, Telemetry, TelemetryConfig};
//!
//! let telemetry = Telemetry::init(
//!     TelemetryConfig::new()
//!         .with_log_format(LogFormat::Pretty)
//!         .with_node_id("node-1"),
//! )?;
//! let deps = deps.with_metrics(telemetry.metrics_clone());
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;
pub use metrics::MetricsRegistry;

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("invalid log format {0:?}, expected json or pretty")]
    InvalidLogFormat(String),

    #[error("failed to render metrics")]
    Render(#[from] std::fmt::Error),
}

/// Process-wide telemetry handle.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::init_without_logging(config))
    }

    /// Metrics only, for callers that manage their own subscriber.
    pub fn init_without_logging(config: TelemetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn metrics_clone(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn render_prometheus(&self) -> Result<String, TelemetryError> {
        Ok(prometheus::render_metrics(&self.metrics)?)
    }
}
