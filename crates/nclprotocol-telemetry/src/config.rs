//! Telemetry configuration.

use crate::TelemetryError;
use std::fmt;
use std::str::FromStr;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, flattened fields.
    #[default]
    Json,
    /// Multi-line human-readable output with source locations.
    Pretty,
}

impl LogFormat {
    /// Case-insensitive parse; `None` for unknown formats.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else if s.eq_ignore_ascii_case("pretty") {
            Ok(Self::Pretty)
        } else {
            Err(TelemetryError::InvalidLogFormat(s.to_string()))
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Logging setup for one agent process.
///
/// `service_name` and `node_id` are recorded on the root span returned by
/// [`TelemetryConfig::root_span`], so every event logged inside it carries
/// them.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,

    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `nclprotocol=debug,info`.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Set when the process speaks for a single compute node.
    pub node_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "ncl".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            node_id: None,
        }
    }
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Span that tags everything logged inside it with the service and node.
    pub fn root_span(&self) -> tracing::Span {
        tracing::info_span!(
            "ncl",
            service = %self.service_name,
            node_id = self.node_id.as_deref().unwrap_or(""),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("Json".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert_eq!(err.to_string(), "invalid log format \"xml\", expected json or pretty");
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
    }
}
