//! Logging setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// Initializes structured logging with tracing-subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to the provided
/// level. Returns false if a global subscriber was already installed.
pub fn init_logging(level: &str, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match format {
        LogFormat::Plain => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}
