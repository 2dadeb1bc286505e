//! Version/verack exchange
//!
//! Acceptance of a peer's version is decided by [`evaluate_version`], a pure
//! function over the config and current session flags, so the policy can be
//! tested without sockets. The `Peer` methods here apply the verdict.

use crate::peer::connection::Peer;
use crate::peer::domain::{
    PeerConfig, PeerEvent, MAX_ADDR_PER_MSG, NET_ADDRESS_TIME_VERSION, REJECT_VERSION,
};
use crate::peer::wire::{
    unix_now, Message, MsgReject, MsgVersion, NetAddress, RejectCode, ServiceFlags, CMD_BLOCK,
    CMD_TX, CMD_VERSION,
};
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of checking a received version message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionVerdict {
    /// The nonce is ours: we dialed ourselves
    SelfConnection,
    /// Compatibility is enforced and the revisions differ
    IncompatibleUpgrade { ours: u32, theirs: u32 },
    /// Below the configured minimum
    Obsolete { minimum: u32 },
    /// A version was already accepted on this session
    Duplicate,
    Accept { negotiated: u32 },
}

/// Decide what to do with a received version. Checks run in a fixed order
/// and the first match wins.
pub fn evaluate_version(
    config: &PeerConfig,
    local_nonce: u64,
    version_known: bool,
    current_version: u32,
    msg: &MsgVersion,
) -> VersionVerdict {
    if msg.nonce == local_nonce {
        return VersionVerdict::SelfConnection;
    }
    if config.enforce_compatibility && msg.protocol_version != config.max_protocol_version {
        return VersionVerdict::IncompatibleUpgrade {
            ours: config.max_protocol_version,
            theirs: msg.protocol_version,
        };
    }
    if msg.protocol_version < config.min_protocol_version {
        return VersionVerdict::Obsolete {
            minimum: config.min_protocol_version,
        };
    }
    if version_known {
        return VersionVerdict::Duplicate;
    }
    VersionVerdict::Accept {
        negotiated: current_version.min(msg.protocol_version),
    }
}

impl Peer {
    /// Handle the peer's version message
    #[instrument(skip(self, msg), fields(peer = %self))]
    pub(crate) async fn handle_version(self: &Arc<Self>, msg: MsgVersion) {
        let config = &self.ctx.config;
        let verdict = {
            let stats = self.stats.lock();
            evaluate_version(
                config,
                self.ctx.nonce,
                stats.version_known,
                stats.protocol_version,
                &msg,
            )
        };

        let negotiated = match verdict {
            VersionVerdict::SelfConnection => {
                debug!("Disconnecting peer connected to self");
                self.disconnect();
                return;
            }
            VersionVerdict::IncompatibleUpgrade { ours, theirs } => {
                error!(ours, theirs, "Protocol version mismatch with enforced compatibility");
                self.disconnect();
                self.ctx.upgrade_gate.incompatible(&self.to_string(), ours, theirs);
                return;
            }
            VersionVerdict::Obsolete { minimum } => {
                let reason = format!("protocol version must be {} or greater", minimum);
                self.push_reject(CMD_VERSION, RejectCode::Obsolete, &reason, None, true)
                    .await;
                self.disconnect();
                return;
            }
            VersionVerdict::Duplicate => {
                self.log_error("Only one version message per peer is allowed");
                self.push_reject(
                    CMD_VERSION,
                    RejectCode::Duplicate,
                    "duplicate version message",
                    None,
                    true,
                )
                .await;
                self.disconnect();
                return;
            }
            VersionVerdict::Accept { negotiated } => negotiated,
        };

        let id = self.ctx.ids.next_id();
        {
            let mut stats = self.stats.lock();
            stats.protocol_version = negotiated;
            stats.version_known = true;
            stats.id = id;
            stats.services = msg.services;
            stats.user_agent = msg.user_agent.clone();
            stats.starting_height = msg.last_block;
            stats.last_block = msg.last_block;
            stats.time_offset = msg.timestamp.saturating_sub(unix_now());
            stats.disable_relay_tx = msg.disable_relay_tx;

            // The provisional outbound entry had no services.
            if !self.inbound() {
                if let Some(na) = stats.net_address.as_mut() {
                    na.services = msg.services;
                }
            }
        }
        debug!(
            id,
            negotiated,
            user_agent = %msg.user_agent,
            last_block = msg.last_block,
            "Accepted peer version"
        );

        if self.inbound() {
            let Some(remote) = self.remote_addr() else {
                self.log_error("Can't get remote address");
                self.disconnect();
                return;
            };
            self.stats.lock().net_address = Some(NetAddress::new(remote, msg.services));
            self.push_version().await;
        }

        self.enqueue_message(Message::VerAck, None).await;

        if !config.sim_net {
            self.update_addresses(&msg).await;
        }

        self.ctx.block_manager.notify_new_session(self.clone()).await;

        if !config.enforce_compatibility && negotiated != config.max_protocol_version {
            self.log_error("Peer needs a client upgrade; banning");
            self.ctx.emit(PeerEvent::Ban(self.clone()));
        }
    }

    /// Handle the peer's verack. Returns false when the session must end.
    pub(crate) fn handle_verack(&self) -> bool {
        {
            let mut stats = self.stats.lock();
            if !stats.version_sent {
                drop(stats);
                info!(peer = %self, "Received verack before version was sent; disconnecting");
                return false;
            }
            if stats.verack_received {
                drop(stats);
                info!(peer = %self, "Already received verack; disconnecting");
                return false;
            }
            stats.verack_received = true;
        }
        self.note_negotiated();
        true
    }

    /// Queue our version message, built from current local state
    pub(crate) async fn push_version(&self) {
        let config = &self.ctx.config;
        let height = self.ctx.block_manager.best_height();
        let their_na = self.net_address().unwrap_or_else(NetAddress::unroutable);

        // Don't reveal the proxy's address to a peer reached through it.
        let mut addr_you = their_na.clone();
        if let Some(proxy) = &config.proxy {
            let proxy_ip = proxy
                .rsplit_once(':')
                .map(|(host, _)| host.trim_matches(|c: char| c == '[' || c == ']'))
                .and_then(|host| host.parse::<IpAddr>().ok());
            if proxy_ip.map_or(true, |ip| ip == their_na.ip_addr()) {
                addr_you = NetAddress::unroutable();
            }
        }
        addr_you.services = ServiceFlags::NODE_NETWORK;

        let addr_me = self.ctx.address_book.best_local_address(&their_na);
        let mut msg = MsgVersion::new(addr_me, addr_you, self.ctx.nonce, height);
        msg.protocol_version = config.max_protocol_version;
        msg.services = config.services;
        msg.user_agent = config.user_agent.clone();

        self.enqueue_message(Message::Version(msg), None).await;
    }

    /// Send a reject for `command`. With `wait`, return once the reject has
    /// been written or dropped, or after the reject deadline.
    pub async fn push_reject(
        &self,
        command: &str,
        code: RejectCode,
        reason: &str,
        hash: Option<[u8; 32]>,
        wait: bool,
    ) {
        {
            let stats = self.stats.lock();
            if stats.version_known && stats.protocol_version < REJECT_VERSION {
                return;
            }
        }

        let mut hash = hash;
        if (command == CMD_TX || command == CMD_BLOCK) && hash.is_none() {
            warn!(peer = %self, command, "Sending a reject without the required hash");
            hash = Some([0u8; 32]);
        }

        let msg = Message::Reject(MsgReject {
            command: command.to_string(),
            code,
            reason: reason.to_string(),
            hash,
        });

        if !wait {
            self.enqueue_message(msg, None).await;
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue_message(msg, Some(done_tx)).await;
        if tokio::time::timeout(self.ctx.config.reject_deadline, done_rx)
            .await
            .is_err()
        {
            debug!(peer = %self, command, "Reject was not flushed before the deadline");
        }
    }

    /// Post-negotiation address exchange with the address book
    async fn update_addresses(&self, msg: &MsgVersion) {
        let Some(na) = self.net_address() else {
            return;
        };
        let book = &self.ctx.address_book;

        if !self.inbound() {
            if !self.ctx.config.disable_listen {
                let local = book.best_local_address(&na);
                if book.is_routable(&local) {
                    self.push_addr(vec![local]).await;
                }
            }

            if book.need_more_addresses() && self.protocol_version() >= NET_ADDRESS_TIME_VERSION {
                self.enqueue_message(Message::GetAddr, None).await;
            }

            book.mark_good(&na);
        } else if msg.addr_me.key() == na.key() {
            // The peer advertises the address we see it on: it can be dialed back.
            book.add_addresses(std::slice::from_ref(&na), &na);
            book.mark_good(&na);
        }
    }

    /// Send addresses the peer isn't already known to have, capped at one
    /// message. Overflow randomly replaces earlier entries.
    pub async fn push_addr(&self, addresses: Vec<NetAddress>) {
        if addresses.is_empty() {
            return;
        }

        let list = {
            let mut known = self.known_addresses.lock();
            let mut rng = rand::thread_rng();
            let mut list = Vec::with_capacity(addresses.len().min(MAX_ADDR_PER_MSG));
            for na in addresses {
                if known.contains(&na.key()) {
                    continue;
                }
                if list.len() >= MAX_ADDR_PER_MSG {
                    let slot = rng.gen_range(0..MAX_ADDR_PER_MSG);
                    list[slot] = na;
                    continue;
                }
                list.push(na);
            }
            for na in &list {
                known.insert(na.key());
            }
            list
        };

        if !list.is_empty() {
            self.enqueue_message(Message::Addr(list), None).await;
        }
    }
}
