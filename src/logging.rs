//! Diagnostic logging setup
//!
//! Diagnostics go through `tracing` to stderr. Build and run output from the
//! service is user output and is written by [`crate::build::BuildLogSink`]
//! implementations instead.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive
pub const LOG_ENV: &str = "TASKPILOT_LOG";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter {0:?}")]
    InvalidFilter(String),

    #[error("logger already initialized")]
    AlreadyInitialized,
}

/// Filter directive used when `TASKPILOT_LOG` is unset
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "taskpilot=debug,taskpilot_api=debug"
    } else {
        "taskpilot=info"
    }
}

/// Install the global subscriber. `--debug` wins over `TASKPILOT_LOG`.
pub fn init(debug: bool) -> Result<(), LoggingError> {
    let directive = match std::env::var(LOG_ENV) {
        Ok(value) if !debug && !value.trim().is_empty() => value,
        _ => default_directive(debug).to_string(),
    };
    let filter =
        EnvFilter::try_new(&directive).map_err(|_| LoggingError::InvalidFilter(directive))?;
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(debug);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
