//! Session state machine and per-session statistics
//!
//! `SessionStats` is the block guarded by a session's stats mutex. The reader
//! mutates it on receipt, the writer on send, and accessors copy values out.

use crate::peer::wire::{NetAddress, ServiceFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Lifecycle of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Constructed, no socket yet
    #[default]
    Created,
    /// Outbound dial in progress
    Connecting,
    /// Socket exists, version/verack exchange in progress
    Handshaking,
    /// Version accepted, our verack sent and theirs received
    Negotiated,
    /// Disconnect requested, tasks winding down
    Disconnecting,
    /// Socket closed and every task exited
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Disconnecting, Closed) => true,
            (Disconnecting, _) => false,
            (_, Disconnecting) | (_, Closed) => true,
            (Created, Connecting) | (Created, Handshaking) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Negotiated) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnecting | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Negotiated => write!(f, "negotiated"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Negotiation flags, counters and timers of one session
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub state: SessionState,
    /// Assigned when the peer's version is accepted; 0 until then
    pub id: u32,
    /// Address-book form of the remote. Outbound sessions start with a
    /// provisional entry; inbound sessions learn it after negotiation.
    pub net_address: Option<NetAddress>,

    pub version_known: bool,
    pub protocol_version: u32,
    pub version_sent: bool,
    pub verack_sent: bool,
    pub verack_received: bool,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub disable_relay_tx: bool,

    pub starting_height: u32,
    pub last_block: u32,
    pub last_announced_block: Option<[u8; 32]>,

    /// Peer clock minus local clock, seconds
    pub time_offset: i64,
    pub time_connected: Option<SystemTime>,
    pub last_send: Option<SystemTime>,
    pub last_recv: Option<SystemTime>,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// Nonce of the outstanding ping, 0 when none
    pub last_ping_nonce: u64,
    pub last_ping_time: Option<Instant>,
    pub last_ping_micros: i64,
}

impl SessionStats {
    pub fn new(protocol_version: u32, services: ServiceFlags) -> Self {
        Self {
            state: SessionState::Created,
            id: 0,
            net_address: None,
            version_known: false,
            protocol_version,
            version_sent: false,
            verack_sent: false,
            verack_received: false,
            services,
            user_agent: String::new(),
            disable_relay_tx: false,
            starting_height: 0,
            last_block: 0,
            last_announced_block: None,
            time_offset: 0,
            time_connected: None,
            last_send: None,
            last_recv: None,
            bytes_sent: 0,
            bytes_received: 0,
            last_ping_nonce: 0,
            last_ping_time: None,
            last_ping_micros: 0,
        }
    }

    /// Move to `next` if legal. Returns whether the state changed.
    pub fn transition_to(&mut self, next: SessionState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        tracing::trace!(from = %self.state, to = %next, "Session state transition");
        self.state = next;
        true
    }

    /// Both sides' version and verack have been exchanged
    pub fn handshake_complete(&self) -> bool {
        self.version_known && self.version_sent && self.verack_sent && self.verack_received
    }

    /// Advance to `Negotiated` once the exchange is complete
    pub fn maybe_negotiated(&mut self) -> bool {
        self.handshake_complete() && self.transition_to(SessionState::Negotiated)
    }
}

/// Point-in-time copy of a session's public details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub addr: String,
    pub inbound: bool,
    pub persistent: bool,
    pub id: u32,
    pub state: SessionState,
    pub protocol_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub starting_height: u32,
    pub last_block: u32,
    pub time_offset: i64,
    pub connected_at: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub ping_micros: i64,
}

pub(crate) fn unix_secs(time: Option<SystemTime>) -> Option<u64> {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}
