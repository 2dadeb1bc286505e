//! Seams to the collaborators a session talks to
//!
//! The address book and block manager live outside the session engine; the
//! traits here are the calls a session makes into them. Simple in-process
//! implementations back the binary and the integration tests.

use crate::peer::connection::Peer;
use crate::peer::domain::MAX_ADDR_PER_MSG;
use crate::peer::wire::{unix_now, InvVect, Message, NetAddress, WireError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Address discovery and bookkeeping
#[cfg_attr(test, mockall::automock)]
pub trait AddressBook: Send + Sync {
    /// Our address most likely to be reachable from `remote`
    fn best_local_address(&self, remote: &NetAddress) -> NetAddress;

    fn is_routable(&self, addr: &NetAddress) -> bool;

    fn need_more_addresses(&self) -> bool;

    fn add_addresses(&self, addrs: &[NetAddress], source: &NetAddress);

    fn mark_good(&self, addr: &NetAddress);

    fn mark_attempted(&self, addr: &NetAddress);

    fn mark_connected(&self, addr: &NetAddress);

    /// Addresses suitable for answering a `getaddr`
    fn address_cache(&self) -> Vec<NetAddress>;
}

/// Consensus/block processing side of the node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockManager: Send + Sync {
    /// Height advertised in our version message
    fn best_height(&self) -> u32;

    /// A session negotiated and is a new sync candidate
    async fn notify_new_session(&self, peer: Arc<Peer>);

    /// A session the manager was told about has ended
    async fn notify_session_ended(&self, peer: Arc<Peer>);

    async fn handle_inventory_announcement(&self, inventory: Vec<InvVect>, peer: Arc<Peer>);

    /// Block, transaction and data-request traffic
    async fn handle_data_message(&self, message: Message, peer: Arc<Peer>);
}

/// Decides which decode errors regression-test mode tolerates
pub trait RegressionPolicy: Send + Sync {
    fn tolerates(&self, error: &WireError, remote: &str) -> bool;
}

/// Tolerates malformed messages only when they come from a loopback address
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackRegressionPolicy;

impl RegressionPolicy for LoopbackRegressionPolicy {
    fn tolerates(&self, error: &WireError, remote: &str) -> bool {
        if !error.is_malformed() {
            return false;
        }
        match remote.parse::<SocketAddr>() {
            Ok(addr) => addr.ip().is_loopback(),
            Err(_) => remote
                .rsplit_once(':')
                .map(|(host, _)| host == "localhost")
                .unwrap_or(false),
        }
    }
}

/// Tolerates every malformed message regardless of origin
#[derive(Debug, Default, Clone, Copy)]
pub struct TolerateMalformed;

impl RegressionPolicy for TolerateMalformed {
    fn tolerates(&self, error: &WireError, _remote: &str) -> bool {
        error.is_malformed()
    }
}

/// Invoked when compatibility-enforced mode meets a peer on another revision
pub trait UpgradeGate: Send + Sync {
    fn incompatible(&self, peer: &str, ours: u32, theirs: u32);
}

/// Fail fast: tell the operator to upgrade and terminate the process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExitGate;

impl UpgradeGate for ProcessExitGate {
    fn incompatible(&self, peer: &str, ours: u32, theirs: u32) {
        let banner = format!(
            "VERSION MISMATCH with {} - ours {} vs theirs {} -- please upgrade your software",
            peer, ours, theirs
        );
        error!(peer = %peer, ours, theirs, "{}", banner);
        eprintln!("\n******************** IMPORTANT ********************\n{}\n", banner);
        std::process::exit(1);
    }
}

#[derive(Debug, Clone)]
struct KnownAddress {
    addr: NetAddress,
    attempts: u32,
    last_attempt: Option<i64>,
    last_success: Option<i64>,
    good: bool,
}

/// In-memory address book
#[derive(Debug, Default)]
pub struct MemoryAddressBook {
    local: Mutex<Vec<NetAddress>>,
    known: Mutex<HashMap<String, KnownAddress>>,
    capacity: usize,
}

impl MemoryAddressBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            local: Mutex::new(Vec::new()),
            known: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Register one of our own reachable addresses
    pub fn add_local_address(&self, addr: NetAddress) {
        self.local.lock().push(addr);
    }

    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.known.lock().contains_key(&addr.key())
    }

    pub fn is_good(&self, addr: &NetAddress) -> bool {
        self.known
            .lock()
            .get(&addr.key())
            .map(|known| known.good)
            .unwrap_or(false)
    }

    pub fn last_success(&self, addr: &NetAddress) -> Option<i64> {
        self.known
            .lock()
            .get(&addr.key())
            .and_then(|known| known.last_success)
    }

    fn upsert<F: FnOnce(&mut KnownAddress)>(&self, addr: &NetAddress, update: F) {
        let mut known = self.known.lock();
        let entry = known.entry(addr.key()).or_insert_with(|| KnownAddress {
            addr: addr.clone(),
            attempts: 0,
            last_attempt: None,
            last_success: None,
            good: false,
        });
        update(entry);
    }
}

impl AddressBook for MemoryAddressBook {
    fn best_local_address(&self, remote: &NetAddress) -> NetAddress {
        let local = self.local.lock();
        let wants_v4 = remote.ip_addr().is_ipv4();
        local
            .iter()
            .find(|addr| addr.ip_addr().is_ipv4() == wants_v4)
            .or_else(|| local.first())
            .cloned()
            .unwrap_or_else(NetAddress::unroutable)
    }

    fn is_routable(&self, addr: &NetAddress) -> bool {
        match addr.ip_addr() {
            IpAddr::V4(v4) => {
                !(v4.is_unspecified()
                    || v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation())
            }
            IpAddr::V6(v6) => !(v6.is_unspecified() || v6.is_loopback()),
        }
    }

    fn need_more_addresses(&self) -> bool {
        self.len() < self.capacity
    }

    fn add_addresses(&self, addrs: &[NetAddress], source: &NetAddress) {
        let mut added = 0usize;
        for addr in addrs {
            if self.len() >= self.capacity {
                break;
            }
            let is_new = !self.contains(addr);
            self.upsert(addr, |known| {
                if addr.timestamp > known.addr.timestamp {
                    known.addr.timestamp = addr.timestamp;
                }
            });
            if is_new {
                added += 1;
            }
        }
        debug!(source = %source, offered = addrs.len(), added, "Address book updated");
    }

    fn mark_good(&self, addr: &NetAddress) {
        let now = unix_now();
        self.upsert(addr, |known| {
            known.good = true;
            known.attempts = 0;
            known.last_success = Some(now);
        });
    }

    fn mark_attempted(&self, addr: &NetAddress) {
        let now = unix_now();
        self.upsert(addr, |known| {
            known.attempts += 1;
            known.last_attempt = Some(now);
        });
    }

    fn mark_connected(&self, addr: &NetAddress) {
        let now = unix_now();
        self.upsert(addr, |known| {
            known.addr.timestamp = now;
            known.last_success = Some(now);
        });
    }

    fn address_cache(&self) -> Vec<NetAddress> {
        self.known
            .lock()
            .values()
            .filter(|known| known.good || known.attempts < 3)
            .map(|known| known.addr.clone())
            .take(MAX_ADDR_PER_MSG * 2)
            .collect()
    }
}

/// Block manager that only tracks height and logs what sessions report
#[derive(Debug, Default)]
pub struct LoggingBlockManager {
    height: AtomicU32,
}

impl LoggingBlockManager {
    pub fn new(height: u32) -> Self {
        Self {
            height: AtomicU32::new(height),
        }
    }
}

#[async_trait]
impl BlockManager for LoggingBlockManager {
    fn best_height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    async fn notify_new_session(&self, peer: Arc<Peer>) {
        info!(
            peer = %peer,
            id = peer.id(),
            protocol_version = peer.protocol_version(),
            starting_height = peer.starting_height(),
            "New sync candidate"
        );
    }

    async fn notify_session_ended(&self, peer: Arc<Peer>) {
        info!(peer = %peer, id = peer.id(), "Sync candidate gone");
    }

    async fn handle_inventory_announcement(&self, inventory: Vec<InvVect>, peer: Arc<Peer>) {
        for inv in &inventory {
            peer.add_known_inventory(*inv);
        }
        debug!(peer = %peer, count = inventory.len(), "Inventory announced");
    }

    async fn handle_data_message(&self, message: Message, peer: Arc<Peer>) {
        debug!(peer = %peer, command = message.command(), "Data message received");
    }
}
