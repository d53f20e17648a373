//! # Logging
//!
//! Console logging through `tracing-subscriber`. Safe to call more than
//! once; only the first call installs a subscriber, and an already
//! installed global subscriber is left alone.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from
//! [`LoggingConfig::level`]. SQL audit lines are emitted at `debug` under
//! the `trunk::sql` target, so `RUST_LOG=info,trunk::sql=debug` shows
//! statements without the rest of the debug noise.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber described by `config`
pub fn init_logging(config: &LoggingConfig) {
    LOGGING_INITIALIZED.get_or_init(|| {
        let directive = filter_directive(config);
        let use_ansi = std::io::stdout().is_terminal();

        let console_layer = if config.json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(EnvFilter::new(&directive))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(EnvFilter::new(&directive))
                .boxed()
        };

        if tracing_subscriber::registry().with(console_layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        } else {
            tracing::debug!(filter = %directive, json = config.json, "Logging initialized");
        }
    });
}

fn filter_directive(config: &LoggingConfig) -> String {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.level.to_lowercase())
}

/// Log level matching `-v` repetitions on the command line
pub fn verbosity_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_level(0), "info");
        assert_eq!(verbosity_level(1), "debug");
        assert_eq!(verbosity_level(7), "trace");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&LoggingConfig {
            json: true,
            ..config
        });
        tracing::info!("still logging");
    }
}
