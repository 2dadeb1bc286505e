use p2p_peer_session::peer::{
    domain::{PeerConfig, PROTOCOL_VERSION},
    wire::{BoxedReader, BoxedWriter, FramedCodec, MsgVersion, WireCodec, WireError},
    LoggingBlockManager, MemoryAddressBook, Message, NetAddress, Peer, PeerContext, PeerManager,
    SessionState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Nonce our hand-rolled remote puts in its version messages
pub const REMOTE_NONCE: u64 = 0x5EED_0000_0000_0001;

/// Helper function to create and start a manager with in-memory collaborators
pub fn create_test_node(config: PeerConfig) -> Arc<PeerManager> {
    let (ctx, events) = PeerContext::new(
        config,
        Arc::new(MemoryAddressBook::new(100)),
        Arc::new(LoggingBlockManager::new(0)),
    );
    start_manager(ctx, events)
}

pub fn start_manager(
    ctx: PeerContext,
    events: tokio::sync::mpsc::UnboundedReceiver<p2p_peer_session::peer::PeerEvent>,
) -> Arc<PeerManager> {
    let manager = PeerManager::new(ctx, events);
    manager.start();
    manager
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let reached = timeout(STEP_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {}", what);
}

pub fn remote_version(protocol_version: u32, nonce: u64) -> Message {
    let mut msg = MsgVersion::new(NetAddress::unroutable(), NetAddress::unroutable(), nonce, 0);
    msg.protocol_version = protocol_version;
    msg.user_agent = "/raw-remote:0.1/".to_string();
    Message::Version(msg)
}

/// The far end of a session, speaking the framed protocol by hand
pub struct RawRemote {
    reader: BoxedReader,
    writer: BoxedWriter,
    codec: FramedCodec,
}

impl RawRemote {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
            codec: FramedCodec::default(),
        }
    }

    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }

    pub async fn send(&mut self, message: &Message) {
        self.codec
            .write_message(&mut self.writer, message, PROTOCOL_VERSION)
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Result<Message, WireError> {
        let (_, result) = timeout(
            STEP_TIMEOUT,
            self.codec.read_message(&mut self.reader, PROTOCOL_VERSION),
        )
        .await
        .expect("timed out waiting for a message");
        result.map(|(message, _)| message)
    }

    /// Skip messages until one satisfies `wanted`
    pub async fn recv_matching<F: Fn(&Message) -> bool>(&mut self, wanted: F) -> Message {
        loop {
            let message = self.recv().await.expect("connection ended early");
            if wanted(&message) {
                return message;
            }
        }
    }

    /// Read until the session closes the connection
    pub async fn expect_closed(&mut self) {
        loop {
            if self.recv().await.is_err() {
                return;
            }
        }
    }
}

/// Dial a hand-rolled remote from `manager` and complete the handshake
pub async fn negotiated_outbound(manager: &Arc<PeerManager>) -> (Arc<Peer>, RawRemote) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = manager.connect(&addr.to_string(), false).unwrap();

    let (stream, _) = timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("dial never arrived")
        .unwrap();
    let mut remote = RawRemote::new(stream);

    match remote.recv().await.unwrap() {
        Message::Version(v) => assert_eq!(v.protocol_version, PROTOCOL_VERSION),
        other => panic!("expected version first, got {:?}", other),
    }
    remote
        .send(&remote_version(PROTOCOL_VERSION, REMOTE_NONCE))
        .await;
    remote.recv_matching(|m| matches!(m, Message::VerAck)).await;
    remote.send(&Message::VerAck).await;

    wait_until("outbound session negotiated", || {
        peer.state() == SessionState::Negotiated
    })
    .await;
    (peer, remote)
}
