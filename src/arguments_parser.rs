//! Command-line argument parsing and configuration management
//!
//! This module provides CLI argument parsing using clap and maps the parsed
//! arguments onto the session engine's [`PeerConfig`].

use crate::peer::domain::{PeerConfig, MULTIPLE_ADDRESS_VERSION, PROTOCOL_VERSION};
use clap::Parser;
use std::str::FromStr;
use std::time::Duration;

/// Command-line arguments for the peer session node
#[derive(Parser, Debug, Clone)]
#[command(
    name = "p2p_peer_session",
    version,
    about = "Peer-to-peer session engine node",
    long_about = "Accepts and dials peers and keeps persistent ones connected."
)]
pub struct Args {
    /// Local address to accept peers on (e.g., "0.0.0.0:8108")
    #[arg(
        short = 'b',
        long = "bind",
        help = "Local address to listen for inbound peers on; omit to only dial"
    )]
    pub bind_address: Option<String>,

    /// Remote peer addresses to connect to (can be specified multiple times)
    #[arg(
        short = 'p',
        long = "peers",
        help = "Remote peer addresses to dial (e.g., 127.0.0.1:8108 or seed.example:8108)"
    )]
    pub peer_addresses: Vec<String>,

    /// Keep dialed peers connected
    #[arg(
        long = "persistent",
        help = "Treat dialed peers as persistent and reconnect with backoff"
    )]
    pub persistent: bool,

    /// Negotiation timeout in seconds
    #[arg(
        short = 't',
        long = "timeout",
        default_value = "30",
        help = "Seconds a new session has to deliver its version message"
    )]
    pub timeout_secs: u16,

    #[arg(
        long = "max-protocol-version",
        default_value_t = PROTOCOL_VERSION,
        help = "Highest protocol version to advertise"
    )]
    pub max_protocol_version: u32,

    #[arg(
        long = "min-protocol-version",
        default_value_t = MULTIPLE_ADDRESS_VERSION,
        help = "Reject peers advertising a lower protocol version"
    )]
    pub min_protocol_version: u32,

    #[arg(
        long = "enforce-compatibility",
        help = "Only accept peers on exactly our protocol version"
    )]
    pub enforce_compatibility: bool,

    #[arg(long = "proxy", help = "Proxy address (host:port) outbound connections use")]
    pub proxy: Option<String>,

    #[arg(long = "simnet", help = "Simulation network: never exchange addresses")]
    pub sim_net: bool,

    #[arg(long = "regtest", help = "Regression-test mode: tolerate malformed local traffic")]
    pub regression_test: bool,

    #[arg(long = "nolisten", help = "Don't advertise our address to outbound peers")]
    pub disable_listen: bool,

    /// Seconds between inventory announcements
    #[arg(
        long = "trickle-interval",
        default_value = "10",
        help = "Seconds between batched inventory announcements"
    )]
    pub trickle_interval_secs: u16,

    #[arg(
        long = "max-inv-per-msg",
        default_value = "1000",
        help = "Maximum inventory entries in one announcement"
    )]
    pub max_inv_per_msg: usize,

    #[arg(
        long = "start-height",
        default_value = "0",
        help = "Block height to advertise in our version message"
    )]
    pub start_height: u32,

    /// Log level for application output
    #[arg(
        short = 'l',
        long = "log-level",
        default_value = "info",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    pub log_level: LogLevel,

    /// Output log format
    #[arg(
        long = "log-format",
        default_value = "pretty",
        help = "Log output format (pretty, json)"
    )]
    pub log_format: LogFormat,
}

impl Args {
    /// Get the negotiation timeout as Duration
    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.into())
    }

    pub fn trickle_interval(&self) -> Duration {
        Duration::from_secs(self.trickle_interval_secs.into())
    }

    /// Session configuration derived from the arguments; everything not
    /// exposed on the command line keeps its default.
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            max_protocol_version: self.max_protocol_version,
            min_protocol_version: self.min_protocol_version,
            enforce_compatibility: self.enforce_compatibility,
            proxy: self.proxy.clone(),
            sim_net: self.sim_net,
            regression_test: self.regression_test,
            disable_listen: self.disable_listen,
            negotiate_timeout: self.negotiate_timeout(),
            trickle_interval: self.trickle_interval(),
            max_inv_trickle_size: self.max_inv_per_msg,
            ..PeerConfig::default()
        }
    }

    /// Validate the provided arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.is_none() && self.peer_addresses.is_empty() {
            return Err(
                "Nothing to do: give a listen address (--bind) or peers to dial (--peers)"
                    .to_string(),
            );
        }

        // Validate negotiation timeout
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0 seconds".to_string());
        }

        if self.timeout_secs > 300 {
            return Err("Timeout cannot exceed 300 seconds (5 minutes)".to_string());
        }

        if self.min_protocol_version > self.max_protocol_version {
            return Err(format!(
                "Minimum protocol version {} exceeds maximum {}",
                self.min_protocol_version, self.max_protocol_version
            ));
        }

        if self.trickle_interval_secs == 0 {
            return Err("Trickle interval must be at least 1 second".to_string());
        }

        if self.max_inv_per_msg == 0 {
            return Err("Maximum inventory per message must be greater than 0".to_string());
        }

        // Validate peer address formats (can be IP:port or hostname:port)
        for addr in self.peer_addresses.iter().chain(self.bind_address.iter()) {
            if !addr.contains(':') {
                return Err(format!(
                    "Invalid address format '{}'. Must include port (e.g., host:8108)",
                    addr
                ));
            }
        }

        if let Some(proxy) = &self.proxy {
            if !proxy.contains(':') {
                return Err(format!("Invalid proxy '{}'. Must include port", proxy));
            }
        }

        Ok(())
    }
}

/// Log level configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "Invalid log level: '{}'. Valid options: trace, debug, info, warn, error",
                s
            )),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty formatted logs for development
    Pretty,
    /// JSON formatted logs for production
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" | "human" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: pretty, json",
                s
            )),
        }
    }
}
