//! Structured logging for the process hosting the multiplexer.
//!
//! The subscriber is process-global, so installation is first-wins:
//! [`init_logging`] reports whether this call installed it, letting
//! embedders and test harnesses race safely.
//!
//! ## Environment variables
//!
//! - `LOG_LEVEL`: log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: output format (json, pretty, compact) - defaults to json
//! - `RUST_LOG`: overrides log filtering entirely (env_logger format)

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for the process-wide subscriber.
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// Structured JSON for log aggregation.
    Json,
    /// Human-readable with colors and indentation.
    Pretty,
    /// Terminal-friendly, minimal spacing.
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// `RUST_LOG` wins; otherwise the requested level with rumqttc held to
/// warnings (its event loop narrates every packet at lower levels).
fn directive_filter(level: Level) -> EnvFilter {
    match env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) => EnvFilter::new(format!("{level},rumqttc=warn")),
    }
}

/// Install the global subscriber with explicit settings. Returns whether
/// this call installed it; `false` means another initializer won earlier
/// and the existing subscriber stays in effect.
pub fn init_logging(level: Level, format: LogFormat) -> bool {
    let registry = tracing_subscriber::registry().with(directive_filter(level));
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(true).with_target(false))
            .try_init(),
    }
    .is_ok()
}

/// Install the global subscriber from `LOG_LEVEL`/`LOG_FORMAT`.
pub fn init_default_logging() -> bool {
    let level = match env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "INFO".to_string())
        .to_uppercase()
        .as_str()
    {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    };
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    init_logging(level, format)
}
