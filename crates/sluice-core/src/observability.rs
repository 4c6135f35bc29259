//! Observability infrastructure for Sluice.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by the engine and the
//! services embedding it.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), defaulting to pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sluice_flow=debug`)
///
/// # Example
///
/// ```rust
/// use sluice_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
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

/// Creates a span for operations on one resource unit of a constraint.
///
/// # Example
///
/// ```rust
/// use sluice_core::observability::constraint_span;
///
/// let span = constraint_span("promote", "01J0000000000000000000000", "prod-us-east");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn constraint_span(operation: &str, constraint_id: &str, resource_unit: &str) -> Span {
    tracing::info_span!(
        "constraint",
        op = operation,
        constraint_id = constraint_id,
        resource_unit = resource_unit,
    )
}

/// Creates a span for holding-scope lifecycle handling.
#[must_use]
pub fn scope_span(operation: &str, scope_id: &str) -> Span {
    tracing::info_span!("holding_scope", op = operation, scope_id = scope_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn log_format_from_name() {
        assert_eq!(LogFormat::from_name("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_name("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_name("other"), LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = constraint_span("release", "c1", "unit-a");
        let _guard = span.enter();
        tracing::info!("inside constraint span");

        let span = scope_span("scope_end", "stage-1");
        let _guard = span.enter();
        tracing::info!("inside scope span");
    }
}
