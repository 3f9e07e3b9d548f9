//! Custom error types for the station.
//!
//! `StationError` is the single error type surfaced by the control core. It follows the
//! failure taxonomy the state machines react to:
//!
//! - **`Connection`**: a session is not open or its address could not be reached. The acting
//!   state machine falls back to IDLE and the operator must reconnect.
//! - **`Timeout`**: a query did not produce a response within its bound. Recoverable; loops
//!   retry on their next tick.
//! - **`Protocol`**: a response arrived but had an unexpected shape (e.g. a multi-line encoder
//!   read). Drops only the affected machine to IDLE.
//! - **`Range`** / **`UnknownParameter`**: operator input rejected before any I/O happens.
//! - **`Transport`**: wraps the `anyhow` errors raised inside the hardware adapters.
//!
//! Everything else (`Config`, `Io`, `Script`, `Automation`, ...) is ambient plumbing.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type AppResult<T> = std::result::Result<T, StationError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error on '{session}': {reason}")]
    Connection { session: String, reason: String },

    #[error("Timeout after {after:?} waiting for response to '{command}'")]
    Timeout { command: String, after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{field} value {value} is out of range [{min}, {max}]")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),

    #[error("Automation error: {0}")]
    Automation(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Station is shutting down")]
    ShuttingDown,

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<StationError>),
}

impl StationError {
    /// Shorthand for a [`StationError::Connection`].
    pub fn connection(session: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            session: session.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`StationError::Range`] over any displayable bounds.
    pub fn range(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    /// Timeouts are the only errors a loop may simply retry on its next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Operator input errors, raised before any hardware was touched.
    pub fn is_rejected_input(&self) -> bool {
        matches!(self, Self::Range { .. } | Self::UnknownParameter(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StationError::connection("instrument", "session is not open");
        assert_eq!(
            err.to_string(),
            "Connection error on 'instrument': session is not open"
        );
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let err = StationError::Timeout {
            command: "PRINT P6144".into(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("PRINT P6144"));
        assert!(!StationError::Protocol("two lines".into()).is_recoverable());
    }

    #[test]
    fn test_range_error() {
        let err = StationError::range("elevation", 45.0, -90, 10);
        assert!(err.is_rejected_input());
        assert_eq!(err.to_string(), "elevation value 45 is out of range [-90, 10]");
    }

    #[test]
    fn test_transport_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("port vanished").context("Failed to write to serial port");
        let err = StationError::from(inner);
        let text = err.to_string();
        assert!(text.contains("Failed to write to serial port"));
        assert!(text.contains("port vanished"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = StationError::ShutdownFailed(vec![
            StationError::Protocol("drive did not answer".into()),
            StationError::connection("relay", "port closed"),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
