//! # P2P Peer Session
//!
//! Connection-level engine for a peer-to-peer node: one session per remote
//! peer, each running its own handshake, inbound dispatch, outbound
//! scheduling and keepalive, plus a manager that keeps persistent peers
//! connected.

/// CLI argument parsing and configuration management
pub mod arguments_parser;

/// Structured logging and telemetry infrastructure
pub mod telemetry;

/// Peer sessions, wire protocol and lifecycle management
pub mod peer;

// Re-export commonly used types for easier access
pub use arguments_parser::Args;
pub use peer::{Peer, PeerConfig, PeerContext, PeerError, PeerManager};
pub use telemetry::setup_telemetry;
