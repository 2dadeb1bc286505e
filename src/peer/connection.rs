//! A single peer session and its lifecycle
//!
//! Each started session runs three tasks: a reader decoding the inbound
//! stream, a scheduler multiplexing outbound sources, and a writer putting
//! exactly one message at a time on the wire. They share the [`Peer`] and a
//! cancellation token; disconnecting cancels the token and every task winds
//! down to a drained state.

use crate::peer::collaborators::{
    AddressBook, BlockManager, LoopbackRegressionPolicy, ProcessExitGate, RegressionPolicy,
    UpgradeGate,
};
use crate::peer::domain::{direction_str, PeerConfig, PeerError, PeerEvent, SessionIdGenerator};
use crate::peer::envelope::{CompletionSender, OutboundEnvelope};
use crate::peer::known_inventory::KnownInventory;
use crate::peer::session::{unix_secs, PeerSnapshot, SessionState, SessionStats};
use crate::peer::wire::{
    BoxedReader, BoxedWriter, FramedCodec, InvVect, Message, NetAddress, ServiceFlags, WireCodec,
};
use crate::peer::{reader, scheduler, writer};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

/// Collaborators and configuration shared by every session of one manager
pub struct PeerContext {
    pub config: PeerConfig,

    /// Random per-process value carried in our version messages
    pub nonce: u64,

    pub address_book: Arc<dyn AddressBook>,
    pub block_manager: Arc<dyn BlockManager>,
    pub codec: Arc<dyn WireCodec>,
    pub ids: Arc<SessionIdGenerator>,
    pub regression_policy: Arc<dyn RegressionPolicy>,
    pub upgrade_gate: Arc<dyn UpgradeGate>,

    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerContext {
    /// Build a context with the default codec and policies. The returned
    /// receiver yields the events sessions raise for their owner.
    pub fn new(
        config: PeerConfig,
        address_book: Arc<dyn AddressBook>,
        block_manager: Arc<dyn BlockManager>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            config,
            nonce: rand::random(),
            address_book,
            block_manager,
            codec: Arc::new(FramedCodec::default()),
            ids: Arc::new(SessionIdGenerator::new()),
            regression_policy: Arc::new(LoopbackRegressionPolicy),
            upgrade_gate: Arc::new(ProcessExitGate),
            events,
        };
        (ctx, events_rx)
    }

    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_regression_policy(mut self, policy: Arc<dyn RegressionPolicy>) -> Self {
        self.regression_policy = policy;
        self
    }

    pub fn with_upgrade_gate(mut self, gate: Arc<dyn UpgradeGate>) -> Self {
        self.upgrade_gate = gate;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<SessionIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        // The owner may already be gone during process shutdown.
        let _ = self.events.send(event);
    }
}

/// Queue receivers handed to the scheduler on start
pub(crate) struct SessionIo {
    pub(crate) output_rx: mpsc::Receiver<OutboundEnvelope>,
    pub(crate) inv_rx: mpsc::Receiver<InvVect>,
}

/// One connection to a remote node
pub struct Peer {
    pub(crate) ctx: Arc<PeerContext>,
    addr: String,
    inbound: bool,
    persistent: bool,

    started: AtomicU32,
    connected: AtomicU32,
    disconnect: AtomicU32,
    spawned: AtomicBool,
    live_tasks: AtomicU32,
    retry_count: AtomicU64,

    pub(crate) stats: Mutex<SessionStats>,
    pub(crate) known_inventory: Mutex<KnownInventory>,
    pub(crate) known_addresses: Mutex<HashSet<String>>,
    remote: Mutex<Option<SocketAddr>>,

    pub(crate) cancel: CancellationToken,
    closed: CancellationToken,

    pub(crate) output_tx: mpsc::Sender<OutboundEnvelope>,
    inv_tx: mpsc::Sender<InvVect>,
    io: Mutex<Option<SessionIo>>,
    conn: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl Peer {
    fn base(
        ctx: Arc<PeerContext>,
        addr: String,
        inbound: bool,
        persistent: bool,
        retry_count: u64,
    ) -> Self {
        let buffer = ctx.config.output_buffer_size.max(1);
        let (output_tx, output_rx) = mpsc::channel(buffer);
        let (inv_tx, inv_rx) = mpsc::channel(buffer);
        let stats = SessionStats::new(ctx.config.max_protocol_version, ctx.config.services);
        let known_inventory = KnownInventory::new(ctx.config.known_inventory_capacity);

        Self {
            ctx,
            addr,
            inbound,
            persistent,
            started: AtomicU32::new(0),
            connected: AtomicU32::new(0),
            disconnect: AtomicU32::new(0),
            spawned: AtomicBool::new(false),
            live_tasks: AtomicU32::new(0),
            retry_count: AtomicU64::new(retry_count),
            stats: Mutex::new(stats),
            known_inventory: Mutex::new(known_inventory),
            known_addresses: Mutex::new(HashSet::new()),
            remote: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            output_tx,
            inv_tx,
            io: Mutex::new(Some(SessionIo { output_rx, inv_rx })),
            conn: Mutex::new(None),
        }
    }

    /// Wrap an accepted TCP connection. Call [`Peer::start`] to run it.
    pub fn new_inbound(ctx: Arc<PeerContext>, stream: TcpStream) -> Result<Arc<Self>, PeerError> {
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Self::base(ctx, remote.to_string(), true, false, 0));
        peer.attach(Box::new(read_half), Box::new(write_half), remote);
        Ok(peer)
    }

    /// Wrap an already established byte stream, e.g. an in-memory duplex
    /// in tests or a proxied connection. Outbound sessions get a provisional
    /// address-book entry; inbound ones learn theirs after negotiation.
    pub fn with_stream<S>(
        ctx: Arc<PeerContext>,
        stream: S,
        remote: SocketAddr,
        inbound: bool,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = Arc::new(Self::base(ctx, remote.to_string(), inbound, false, 0));
        if !inbound {
            peer.stats.lock().net_address = Some(NetAddress::new(remote, ServiceFlags::NONE));
        }
        let (read_half, write_half) = tokio::io::split(stream);
        peer.attach(Box::new(read_half), Box::new(write_half), remote);
        peer
    }

    /// Create an outbound session and dial it in the background. The
    /// address is validated here; dial failures are reported through a
    /// [`PeerEvent::Done`] to the owner.
    #[instrument(skip(ctx))]
    pub fn new_outbound(
        ctx: Arc<PeerContext>,
        addr: &str,
        persistent: bool,
        retry_count: u64,
    ) -> Result<Arc<Self>, PeerError> {
        let target = resolve_address(addr)?;
        let peer = Arc::new(Self::base(ctx, addr.to_string(), false, persistent, retry_count));
        {
            let mut stats = peer.stats.lock();
            // Services are unknown until the peer's version arrives.
            stats.net_address = Some(NetAddress::new(target, ServiceFlags::NONE));
            stats.transition_to(SessionState::Connecting);
        }

        let dialer = peer.clone();
        tokio::spawn(async move { dialer.dial(target).await });
        Ok(peer)
    }

    async fn dial(self: Arc<Self>, target: SocketAddr) {
        if self.is_disconnecting() {
            self.finish_unstarted();
            return;
        }

        let retry_count = self.retry_count();
        if retry_count > 0 {
            let delay = retry_delay(
                self.ctx.config.connection_retry_interval,
                self.ctx.config.max_connection_retry_interval,
                retry_count,
            );
            debug!(
                peer = %self,
                delay_secs = delay.as_secs_f64(),
                retry_count,
                "Retrying connection"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.finish_unstarted();
                    return;
                }
            }
        }

        debug!(peer = %self, "Attempting to connect");
        let stream = tokio::select! {
            result = TcpStream::connect(target) => result,
            _ = self.cancel.cancelled() => {
                self.finish_unstarted();
                return;
            }
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let err = PeerError::DialFailed {
                    addr: self.addr.clone(),
                    source: e,
                };
                self.log_error(&err.to_string());
                self.finish_unstarted();
                return;
            }
        };

        // We may have slept through a shutdown request.
        if self.is_disconnecting() {
            drop(stream);
            self.finish_unstarted();
            return;
        }

        if let Some(na) = self.net_address() {
            self.ctx.address_book.mark_attempted(&na);
        }
        let remote = stream.peer_addr().unwrap_or(target);
        debug!(peer = %self, remote = %remote, "Connected");

        let (read_half, write_half) = stream.into_split();
        self.attach(Box::new(read_half), Box::new(write_half), remote);
        if let Err(e) = self.start().await {
            self.log_error(&format!("Can't start outbound session {}: {}", self, e));
        }
    }

    fn attach(&self, reader: BoxedReader, writer: BoxedWriter, remote: SocketAddr) {
        *self.conn.lock() = Some((reader, writer));
        *self.remote.lock() = Some(remote);
        {
            let mut stats = self.stats.lock();
            stats.time_connected = Some(SystemTime::now());
            stats.transition_to(SessionState::Handshaking);
        }
        self.connected.store(1, Ordering::SeqCst);
    }

    /// Begin processing input and output. Outbound sessions send their
    /// version immediately. Calling this more than once is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), PeerError> {
        if self.started.fetch_add(1, Ordering::SeqCst) != 0 {
            return Ok(());
        }
        trace!(peer = %self, "Starting peer");

        let io = self.io.lock().take();
        let conn = self.conn.lock().take();
        let (Some(io), Some((reader_half, writer_half))) = (io, conn) else {
            self.disconnect();
            self.ctx.emit(PeerEvent::Done(self.clone()));
            return Err(PeerError::MissingConnection(self.to_string()));
        };

        if !self.inbound {
            self.push_version().await;
        }

        let (send_tx, send_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);

        self.live_tasks.store(3, Ordering::SeqCst);
        self.spawned.store(true, Ordering::SeqCst);
        tokio::spawn(reader::run(self.clone(), reader_half));
        tokio::spawn(scheduler::run(self.clone(), io, send_tx, done_rx));
        tokio::spawn(writer::run(self.clone(), writer_half, send_rx, done_tx));
        Ok(())
    }

    /// Gracefully shut the session down
    pub fn shutdown(&self) {
        trace!(peer = %self, "Shutdown peer");
        self.disconnect();
    }

    /// Close the session. Only the first call has any effect: it records a
    /// successful connection with the address book if the handshake
    /// finished, then cancels every task.
    pub fn disconnect(&self) {
        if self.disconnect.fetch_add(1, Ordering::SeqCst) != 0 {
            return;
        }

        let connected_to = {
            let mut stats = self.stats.lock();
            stats.transition_to(SessionState::Disconnecting);
            if stats.verack_received && stats.version_known {
                stats.net_address.clone()
            } else {
                None
            }
        };
        if let Some(na) = connected_to {
            self.ctx.address_book.mark_connected(&na);
        }

        trace!(peer = %self, "Disconnecting");
        self.cancel.cancel();

        // Without running tasks nobody else will release the socket.
        if !self.spawned.load(Ordering::SeqCst) {
            drop(self.conn.lock().take());
            self.mark_closed();
        }
    }

    fn finish_unstarted(self: &Arc<Self>) {
        self.disconnect();
        self.mark_closed();
        self.ctx.emit(PeerEvent::Done(self.clone()));
    }

    pub(crate) fn task_exited(&self) {
        if self.live_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            trace!(peer = %self, "All session tasks exited");
            self.mark_closed();
        }
    }

    fn mark_closed(&self) {
        self.stats.lock().transition_to(SessionState::Closed);
        self.closed.cancel();
    }

    /// Resolves once the socket is closed and every task has exited
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Queue a message for the writer. The optional completion signal fires
    /// once the message was written, dropped, or abandoned at shutdown.
    pub async fn enqueue_message(&self, message: Message, done: Option<CompletionSender>) {
        let envelope = OutboundEnvelope::new(message, done);

        // The scheduler may already have exited; dropping the envelope
        // releases any waiter.
        if !self.is_connected() {
            return;
        }

        tokio::select! {
            result = self.output_tx.send(envelope) => {
                if let Err(mpsc::error::SendError(envelope)) = result {
                    envelope.complete();
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Queue inventory for the next trickle. Inventory the peer is already
    /// known to have is ignored.
    pub async fn enqueue_inventory(&self, inv: InvVect) {
        if self.is_known_inventory(&inv) || !self.is_connected() {
            return;
        }

        tokio::select! {
            _ = self.inv_tx.send(inv) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) != 0 && self.disconnect.load(Ordering::SeqCst) == 0
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst) != 0
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn inbound(&self) -> bool {
        self.inbound
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_retry_count(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    /// Socket-level address of the remote, once connected
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    /// Best known IP of the remote
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr()
            .or_else(|| self.net_address().map(|na| na.socket_addr()))
            .map(|addr| addr.ip())
    }

    pub fn net_address(&self) -> Option<NetAddress> {
        self.stats.lock().net_address.clone()
    }

    pub fn id(&self) -> u32 {
        self.stats.lock().id
    }

    pub fn state(&self) -> SessionState {
        self.stats.lock().state
    }

    pub fn version_known(&self) -> bool {
        self.stats.lock().version_known
    }

    pub fn handshake_complete(&self) -> bool {
        self.stats.lock().handshake_complete()
    }

    /// Negotiated protocol revision (our maximum until negotiated)
    pub fn protocol_version(&self) -> u32 {
        self.stats.lock().protocol_version
    }

    pub fn services(&self) -> ServiceFlags {
        self.stats.lock().services
    }

    pub fn user_agent(&self) -> String {
        self.stats.lock().user_agent.clone()
    }

    pub fn relay_tx_disabled(&self) -> bool {
        self.stats.lock().disable_relay_tx
    }

    pub fn starting_height(&self) -> u32 {
        self.stats.lock().starting_height
    }

    pub fn last_block(&self) -> u32 {
        self.stats.lock().last_block
    }

    pub fn update_last_block_height(&self, height: u32) {
        let mut stats = self.stats.lock();
        trace!(peer = %self, from = stats.last_block, to = height, "Updating last block height");
        stats.last_block = height;
    }

    pub fn last_announced_block(&self) -> Option<[u8; 32]> {
        self.stats.lock().last_announced_block
    }

    pub fn update_last_announced_block(&self, hash: [u8; 32]) {
        self.stats.lock().last_announced_block = Some(hash);
    }

    /// Peer clock minus ours, in seconds
    pub fn time_offset(&self) -> i64 {
        self.stats.lock().time_offset
    }

    pub fn ping_micros(&self) -> i64 {
        self.stats.lock().last_ping_micros
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.lock().bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats.lock().bytes_received
    }

    pub fn is_known_inventory(&self, inv: &InvVect) -> bool {
        self.known_inventory.lock().exists(inv)
    }

    pub fn add_known_inventory(&self, inv: InvVect) {
        self.known_inventory.lock().add(inv);
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let stats = self.stats.lock();
        PeerSnapshot {
            addr: self.addr.clone(),
            inbound: self.inbound,
            persistent: self.persistent,
            id: stats.id,
            state: stats.state,
            protocol_version: stats.protocol_version,
            services: stats.services.0,
            user_agent: stats.user_agent.clone(),
            starting_height: stats.starting_height,
            last_block: stats.last_block,
            time_offset: stats.time_offset,
            connected_at: unix_secs(stats.time_connected),
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            ping_micros: stats.last_ping_micros,
        }
    }

    #[cfg(test)]
    pub(crate) fn take_io_for_test(&self) -> SessionIo {
        self.io.lock().take().expect("session io already taken")
    }

    /// Errors are loud only for peers the operator asked for
    pub(crate) fn log_error(&self, message: &str) {
        if self.persistent {
            error!(peer = %self, "{}", message);
        } else {
            debug!(peer = %self, "{}", message);
        }
    }

    pub(crate) fn note_negotiated(&self) {
        let negotiated = self.stats.lock().maybe_negotiated();
        if negotiated {
            self.reset_retry_count();
            info!(
                peer = %self,
                id = self.id(),
                protocol_version = self.protocol_version(),
                "Session negotiated"
            );
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, direction_str(self.inbound))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .field("persistent", &self.persistent)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Delay before redialing a persistent peer:
/// `min(max_interval, base_interval * retry_count / 2)`
pub fn retry_delay(base_interval: Duration, max_interval: Duration, retry_count: u64) -> Duration {
    let factor = u32::try_from(retry_count).unwrap_or(u32::MAX);
    let scaled = base_interval.saturating_mul(factor) / 2;
    scaled.min(max_interval)
}

/// Parse `host:port` eagerly so bad targets fail at construction
fn resolve_address(addr: &str) -> Result<SocketAddr, PeerError> {
    let invalid = |reason: String| PeerError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port".to_string()))?;
    port.parse::<u16>()
        .map_err(|e| invalid(format!("invalid port '{}': {}", port, e)))?;
    if host.is_empty() {
        return Err(invalid("missing host".to_string()));
    }

    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host did not resolve".to_string()))
}
