//! Logging setup
//!
//! All crates log through `tracing`; binaries call [`setup_logging`] once at
//! startup. `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingSettings;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
///
/// `level` is either a bare level (`"debug"`) or a full filter directive
/// (`"host=trace,descriptor=info"`).
pub fn setup_logging(level: &str) -> crate::Result<()> {
    setup_logging_with(&LoggingSettings {
        level: level.to_string(),
        ..LoggingSettings::default()
    })
}

/// Install the global tracing subscriber from configuration
pub fn setup_logging_with(settings: &LoggingSettings) -> crate::Result<()> {
    let filter = build_filter(&settings.level)?;

    // The event loop runs on its own named thread; showing thread names
    // makes completion ordering readable in debug output.
    let layer = fmt::layer()
        .with_target(settings.show_target)
        .with_thread_names(settings.thread_names);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| crate::Error::Logging(e.to_string()))
}

fn build_filter(level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter '{}': {}", level, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("host=trace,descriptor=info").is_ok());
    }
}
