//! Logging initialization and span helpers.
//!
//! Structured logging via `tracing`. The hot admission path does not log;
//! spans carry the operation and prefix so housekeeping and control-plane
//! activity can be correlated across front-ends.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Safe to call multiple times; subsequent
/// calls are no-ops. Log levels come from `RUST_LOG` (default `info`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for admission operations on one waiting room.
#[must_use]
pub fn admission_span(operation: &str, prefix: &str) -> Span {
    tracing::info_span!("admission", op = operation, prefix = prefix)
}

/// Creates a span for one housekeeping cycle.
#[must_use]
pub fn sweep_span(prefix: &str, holder: &str) -> Span {
    tracing::info_span!("sweep", prefix = prefix, holder = holder)
}
