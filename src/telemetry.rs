//! Telemetry and logging infrastructure
//!
//! Structured logging via tracing: compact human output for development,
//! Bunyan JSON for log shippers. Session events carry a `peer` field so one
//! session's history can be filtered out of a busy node's log.

use crate::arguments_parser::{LogFormat, LogLevel};
use crate::peer::PeerSnapshot;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the telemetry and logging infrastructure
///
/// Session engine events are filtered at `log_level`; other crates follow
/// `RUST_LOG`.
pub fn setup_telemetry(log_level: LogLevel, log_format: LogFormat) -> Result<(), String> {
    // Create base filter from log level
    let base_filter = EnvFilter::from_default_env().add_directive(
        format!("p2p_peer_session={}", level_to_str(&log_level))
            .parse()
            .map_err(|e| format!("Invalid log level directive: {}", e))?,
    );

    match log_format {
        LogFormat::Pretty => setup_pretty_logging(base_filter),
        LogFormat::Json => setup_json_logging(base_filter),
    }
}

/// Setup pretty-formatted logging for development
fn setup_pretty_logging(filter: EnvFilter) -> Result<(), String> {
    let formatting_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(formatting_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize pretty logging: {}", e))?;

    tracing::info!("Pretty logging initialized");
    Ok(())
}

/// Setup JSON-formatted logging for production
fn setup_json_logging(filter: EnvFilter) -> Result<(), String> {
    // Create a Bunyan-style JSON formatter for structured logs
    let bunyan_formatting_layer = tracing_bunyan_formatter::BunyanFormattingLayer::new(
        "p2p_peer_session".to_string(),
        std::io::stdout,
    );

    let json_layer = tracing_bunyan_formatter::JsonStorageLayer;

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(bunyan_formatting_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize JSON logging: {}", e))?;

    tracing::info!("JSON logging initialized");
    Ok(())
}

/// Convert LogLevel to string representation for EnvFilter
fn level_to_str(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Helper functions to log errors with their complete error chain
pub fn log_error_chain(error: &dyn std::error::Error) {
    let mut chain = Vec::new();
    let mut source = Some(error);

    while let Some(err) = source {
        chain.push(err.to_string());
        source = err.source();
    }

    tracing::error!(
        error.message = %error,
        error.chain = ?chain,
        "Error occurred with full chain"
    );
}

/// Log successful operations with timing information
pub fn log_operation_success(operation: &str, duration: std::time::Duration) {
    tracing::info!(
        operation = operation,
        duration_ms = duration.as_millis(),
        "Operation completed successfully"
    );
}

/// Log failed operations with error details
pub fn log_operation_failure(
    operation: &str,
    error: &dyn std::error::Error,
    duration: std::time::Duration,
) {
    tracing::error!(
        operation = operation,
        duration_ms = duration.as_millis(),
        error.message = %error,
        "Operation failed"
    );
    log_error_chain(error);
}

/// Emit one structured line per session
pub fn log_session_snapshots(snapshots: &[PeerSnapshot]) {
    for snapshot in snapshots {
        match serde_json::to_string(snapshot) {
            Ok(json) => tracing::info!(
                peer = %snapshot.addr,
                state = %snapshot.state,
                snapshot = %json,
                "Session snapshot"
            ),
            Err(e) => tracing::warn!(
                peer = %snapshot.addr,
                error = %e,
                "Can't serialize session snapshot"
            ),
        }
    }
}

/// Configuration for telemetry in different environments
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "p2p_peer_session".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        }
    }
}

impl TelemetryConfig {
    /// Create telemetry config from environment variables
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "p2p_peer_session".to_string()),
            service_version: std::env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        }
    }
}
