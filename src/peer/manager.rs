//! Session registry and connection lifecycle
//!
//! The manager owns every live [`Peer`], accepts inbound connections, dials
//! outbound ones and reacts to the events sessions raise: finished sessions
//! leave the registry and persistent ones are redialed with backoff; peers
//! flagged for banning are disconnected and their IP refused from then on.

use crate::peer::connection::{Peer, PeerContext};
use crate::peer::domain::{PeerError, PeerEvent};
use crate::peer::session::PeerSnapshot;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on waiting for one session to close during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct PeerManager {
    ctx: Arc<PeerContext>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    peers: Mutex<Vec<Arc<Peer>>>,
    banned: Mutex<HashSet<IpAddr>>,
    shutdown: CancellationToken,
}

impl PeerManager {
    pub fn new(ctx: PeerContext, events: mpsc::UnboundedReceiver<PeerEvent>) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(ctx),
            events: Mutex::new(Some(events)),
            peers: Mutex::new(Vec::new()),
            banned: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> &Arc<PeerContext> {
        &self.ctx
    }

    /// Spawn the event loop. Only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().take() else {
            return;
        };

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => manager.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("Peer event loop stopped");
        });
    }

    /// Bind a listener and accept inbound sessions until shutdown.
    /// Returns the bound address.
    #[instrument(skip(self))]
    pub async fn listen(self: &Arc<Self>, bind: &str) -> Result<SocketAddr, PeerError> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        info!(local_addr = %local, "Listening for peers");

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        if let Err(e) = manager.add_inbound(stream).await {
                            debug!(remote = %remote, error = %e, "Inbound connection refused");
                        }
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
            debug!(local_addr = %local, "Listener stopped");
        });

        Ok(local)
    }

    /// Register and start a session for an accepted connection
    pub async fn add_inbound(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<Peer>, PeerError> {
        let remote = stream.peer_addr()?;
        if self.shutdown.is_cancelled() {
            return Err(PeerError::NotConnected(remote.to_string()));
        }
        if self.is_banned(&remote.ip()) {
            return Err(PeerError::Banned(remote.ip().to_string()));
        }

        let peer = Peer::new_inbound(self.ctx.clone(), stream)?;
        self.register(peer.clone());
        info!(peer = %peer, "New inbound peer");
        peer.start().await?;
        Ok(peer)
    }

    /// Dial `addr`. Persistent peers are redialed whenever they go away.
    pub fn connect(self: &Arc<Self>, addr: &str, persistent: bool) -> Result<Arc<Peer>, PeerError> {
        self.connect_with_retry(addr, persistent, 0)
    }

    fn connect_with_retry(
        self: &Arc<Self>,
        addr: &str,
        persistent: bool,
        retry_count: u64,
    ) -> Result<Arc<Peer>, PeerError> {
        if self.shutdown.is_cancelled() {
            return Err(PeerError::NotConnected(addr.to_string()));
        }

        let peer = Peer::new_outbound(self.ctx.clone(), addr, persistent, retry_count)?;
        self.register(peer.clone());
        debug!(peer = %peer, retry_count, "Dialing peer");
        Ok(peer)
    }

    fn register(&self, peer: Arc<Peer>) {
        self.peers.lock().push(peer);
    }

    fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| !Arc::ptr_eq(p, peer));
        peers.len() != before
    }

    fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Done(peer) => {
                if self.remove(&peer) {
                    debug!(peer = %peer, "Removed peer");
                }

                if !peer.persistent() || self.shutdown.is_cancelled() {
                    return;
                }
                if peer.remote_ip().is_some_and(|ip| self.is_banned(&ip)) {
                    return;
                }

                let retry_count = peer.retry_count() + 1;
                if let Err(e) = self.connect_with_retry(peer.addr(), true, retry_count) {
                    warn!(peer = %peer, error = %e, "Can't reconnect persistent peer");
                }
            }
            PeerEvent::Ban(peer) => {
                if let Some(ip) = peer.remote_ip() {
                    warn!(peer = %peer, ip = %ip, "Banning peer");
                    self.banned.lock().insert(ip);
                }
                peer.disconnect();
            }
        }
    }

    pub fn ban(&self, ip: IpAddr) {
        self.banned.lock().insert(ip);
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned.lock().contains(ip)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        self.peers().iter().map(|p| p.snapshot()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting and redialing, disconnect every session and wait for
    /// each to close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let peers = self.peers();
        info!(count = peers.len(), "Shutting down peers");

        for peer in &peers {
            peer.shutdown();
        }
        for peer in &peers {
            if tokio::time::timeout(SHUTDOWN_GRACE, peer.wait_closed())
                .await
                .is_err()
            {
                warn!(peer = %peer, "Peer did not close in time");
            }
        }
        self.peers.lock().clear();
    }
}
