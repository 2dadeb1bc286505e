//! Peer session engine
//!
//! This module contains everything needed to run sessions with remote nodes:
//! - Wire types and the framed codec
//! - The per-session state machine, handshake and message handlers
//! - The reader, scheduler and writer tasks of a running session
//! - The manager that owns sessions, reconnects and bans

/// Constants, configuration, errors and events shared across sessions
pub mod domain;

/// Message types, addresses and the framing codec
pub mod wire;

/// Bounded record of inventory a peer already has
pub mod known_inventory;

/// Queued outbound message with its completion signal
pub mod envelope;

/// Session state machine and statistics
pub mod session;

/// Address book, block manager and policy seams
pub mod collaborators;

/// The `Peer` type and its lifecycle
pub mod connection;

/// Version/verack negotiation
pub mod handshake;

/// Registry, accept loop and reconnection
pub mod manager;

mod reader;
mod scheduler;
mod writer;

pub use collaborators::{
    AddressBook, BlockManager, LoggingBlockManager, LoopbackRegressionPolicy, MemoryAddressBook,
    ProcessExitGate, RegressionPolicy, TolerateMalformed, UpgradeGate,
};
pub use connection::{retry_delay, Peer, PeerContext};
pub use domain::{PeerConfig, PeerError, PeerEvent, SessionIdGenerator};
pub use envelope::OutboundEnvelope;
pub use handshake::{evaluate_version, VersionVerdict};
pub use known_inventory::KnownInventory;
pub use manager::PeerManager;
pub use session::{PeerSnapshot, SessionState};
pub use wire::{FramedCodec, InvType, InvVect, Message, NetAddress, ServiceFlags, WireCodec};
