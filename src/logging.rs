//! Tracing subscriber setup for the station binary.
//!
//! `RUST_LOG` wins when set; otherwise the filter comes from `application.log_level`.
//! Device traffic is emitted at `debug` under the `session` target, so a useful
//! troubleshooting filter is:
//!
//! ```text
//! RUST_LOG=info,session=debug,automation=debug
//! ```

use crate::config::ApplicationConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-readable
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Subscriber options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Line format
    pub format: LogFormat,
    /// Colour output (ignored for JSON)
    pub ansi: bool,
}

impl From<&ApplicationConfig> for LogConfig {
    fn from(config: &ApplicationConfig) -> Self {
        Self {
            level: config.log_level.clone(),
            format: if config.log_json {
                LogFormat::Json
            } else {
                LogFormat::Compact
            },
            ansi: !config.log_json,
        }
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let env_filter = filter(&config.level);
    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(config.ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Failed to initialize tracing: {e}")),
    }
}
