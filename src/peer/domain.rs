//! Domain models, protocol constants and error types for peer sessions
//!
//! This module defines the read-only process configuration shared by every
//! session, the error enum surfaced by the lifecycle API and the small
//! process-level helpers (session id generation, manager events).

use crate::peer::wire::ServiceFlags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Protocol revision spoken by this node
pub const PROTOCOL_VERSION: u32 = 70002;

/// Lowest revision that carries multiple addresses per `addr` message.
/// Peers below it are rejected as obsolete.
pub const MULTIPLE_ADDRESS_VERSION: u32 = 209;

/// First revision whose addresses carry a timestamp
pub const NET_ADDRESS_TIME_VERSION: u32 = 31402;

/// First revision after which ping carries a nonce and expects a pong
pub const BIP0031_VERSION: u32 = 60000;

/// First revision that understands `reject`
pub const REJECT_VERSION: u32 = 70002;

/// Maximum addresses carried by a single `addr` message
pub const MAX_ADDR_PER_MSG: usize = 1000;

/// User agent advertised in outgoing version messages
pub const DEFAULT_USER_AGENT: &str = concat!("/p2p_peer_session:", env!("CARGO_PKG_VERSION"), "/");

/// Errors surfaced by session construction and lifecycle operations
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Invalid peer address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to connect to {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer {0} is not connected")]
    NotConnected(String),

    #[error("Peer {0} has no socket attached")]
    MissingConnection(String),

    #[error("Address {0} is banned")]
    Banned(String),

    #[error("Network I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only process configuration consulted by every session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Highest protocol revision we advertise and negotiate down from
    pub max_protocol_version: u32,

    /// Peers advertising less than this are rejected as obsolete
    pub min_protocol_version: u32,

    /// Refuse any revision other than ours and terminate the process
    pub enforce_compatibility: bool,

    /// Outbound proxy (`host:port`), used to avoid leaking its address
    pub proxy: Option<String>,

    /// Isolated simulation network: no address exchange
    pub sim_net: bool,

    /// Regression-test mode: tolerate malformed messages per the
    /// session's regression policy
    pub regression_test: bool,

    /// Do not advertise our own address to outbound peers
    pub disable_listen: bool,

    pub user_agent: String,

    pub services: ServiceFlags,

    /// Bound on the time to receive the first version message
    pub negotiate_timeout: Duration,

    /// Idle bound after negotiation, reset on every processed message
    pub idle_timeout: Duration,

    /// Keepalive: ping after this long without a reply-expecting send
    pub ping_interval: Duration,

    pub trickle_interval: Duration,

    /// Maximum inventory vectors in a single trickled announcement
    pub max_inv_trickle_size: usize,

    pub known_inventory_capacity: usize,

    /// Capacity of the direct-message and inventory queues
    pub output_buffer_size: usize,

    pub connection_retry_interval: Duration,

    pub max_connection_retry_interval: Duration,

    /// Upper bound on waiting for a reject to hit the wire before teardown
    pub reject_deadline: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MULTIPLE_ADDRESS_VERSION,
            enforce_compatibility: false,
            proxy: None,
            sim_net: false,
            regression_test: false,
            disable_listen: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            services: ServiceFlags::NODE_NETWORK,
            negotiate_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            ping_interval: Duration::from_secs(2 * 60),
            trickle_interval: Duration::from_secs(10),
            max_inv_trickle_size: 1000,
            known_inventory_capacity: 1000,
            output_buffer_size: 50,
            connection_retry_interval: Duration::from_secs(10),
            max_connection_retry_interval: Duration::from_secs(5 * 60),
            reject_deadline: Duration::from_secs(5),
        }
    }
}

/// Monotonic source of session ids, injected into every session so that ids
/// are unique within one manager (and therefore one process)
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last: AtomicU32,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id. The first id handed out is 1.
    pub fn next_id(&self) -> u32 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Notifications a session sends to its owning manager
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The session ended (or its dial failed) and every task is winding down
    Done(Arc<crate::peer::Peer>),

    /// The session negotiated an incompatible revision and should be banned
    Ban(Arc<crate::peer::Peer>),
}

/// Human readable direction of a session, used in logs
pub fn direction_str(inbound: bool) -> &'static str {
    if inbound {
        "inbound"
    } else {
        "outbound"
    }
}
