//! Wire message types and the codec seam used by the reader and writer tasks
//!
//! The session engine only needs to know a message's kind and a handful of
//! handshake fields; everything else is opaque payload routed to the block
//! manager. Framing is pluggable through [`WireCodec`]. [`FramedCodec`] is
//! the default: a little-endian `magic | length` header followed by a Borsh
//! encoded [`Message`].

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default network magic prefixed to every frame
pub const DEFAULT_MAGIC: u32 = 0xFAC7_0D11;

/// Largest payload the default codec accepts (32 MiB)
pub const MAX_MESSAGE_PAYLOAD: usize = 32 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Read half of a session socket
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a session socket
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors produced while decoding or encoding messages
#[derive(Error, Debug)]
pub enum WireError {
    /// The remote closed the stream on a message boundary
    #[error("stream closed by remote")]
    Closed,

    /// The bytes received do not form a valid message
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("wire I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether the remote simply hung up
    pub fn is_clean_close(&self) -> bool {
        matches!(self, WireError::Closed)
    }

    /// Whether this is a message-level error rather than a transport one
    pub fn is_malformed(&self) -> bool {
        matches!(self, WireError::Malformed(_))
    }
}

/// Capability bits advertised in version messages and addresses
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    pub const NODE_NETWORK: ServiceFlags = ServiceFlags(1);

    pub fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A network address as carried on the wire (IPv4 is stored IPv6-mapped)
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NetAddress {
    /// Unix seconds this address was last seen
    pub timestamp: i64,
    pub services: ServiceFlags,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            timestamp: unix_now(),
            services,
            ip: ip.octets(),
            port: addr.port(),
        }
    }

    /// The all-zero address, used to avoid leaking a proxy's address
    pub fn unroutable() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), ServiceFlags::NONE)
    }

    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    /// Stable key identifying this address regardless of timestamp/services
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Kind of object an inventory vector refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    Entry,
}

/// Inventory identifier: object kind plus hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct InvVect {
    pub kind: InvType,
    pub hash: [u8; 32],
}

impl InvVect {
    pub fn new(kind: InvType, hash: [u8; 32]) -> Self {
        Self { kind, hash }
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ", self.kind)?;
        for byte in &self.hash[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// Reason codes carried by `reject`
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

/// The handshake message
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MsgVersion {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    /// Sender's clock, unix seconds
    pub timestamp: i64,
    pub addr_you: NetAddress,
    pub addr_me: NetAddress,
    /// Random per-process value used to detect self connections
    pub nonce: u64,
    pub user_agent: String,
    pub last_block: u32,
    pub disable_relay_tx: bool,
}

impl MsgVersion {
    pub fn new(addr_me: NetAddress, addr_you: NetAddress, nonce: u64, last_block: u32) -> Self {
        Self {
            protocol_version: crate::peer::domain::PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            timestamp: unix_now(),
            addr_you,
            addr_me,
            nonce,
            user_agent: String::new(),
            last_block,
            disable_relay_tx: false,
        }
    }
}

/// Rejection of a previously received message
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MsgReject {
    pub command: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<[u8; 32]>,
}

/// Every message the session engine can send or receive
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    Version(MsgVersion),
    VerAck,
    Reject(MsgReject),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    Block { hash: [u8; 32], payload: Vec<u8> },
    Tx { hash: [u8; 32], payload: Vec<u8> },
    Alert(Vec<u8>),
}

pub const CMD_VERSION: &str = "version";
pub const CMD_VERACK: &str = "verack";
pub const CMD_REJECT: &str = "reject";
pub const CMD_BLOCK: &str = "block";
pub const CMD_TX: &str = "tx";

impl Message {
    /// Protocol command name
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => CMD_VERSION,
            Message::VerAck => CMD_VERACK,
            Message::Reject(_) => CMD_REJECT,
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Block { .. } => CMD_BLOCK,
            Message::Tx { .. } => CMD_TX,
            Message::Alert(_) => "alert",
        }
    }

    /// Kinds allowed onto the wire before the peer's version is known
    pub fn is_handshake_control(&self) -> bool {
        matches!(self, Message::Version(_) | Message::Reject(_))
    }

    /// Kinds that should provoke a reply from the remote. Sending one of
    /// these postpones the keepalive ping.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Message::Version(_) | Message::GetAddr | Message::Ping { .. } | Message::GetData(_)
        )
    }

    /// Short one-line description for debug logs
    pub fn summary(&self) -> String {
        match self {
            Message::Version(v) => format!(
                "agent {}, pver {}, block {}",
                v.user_agent, v.protocol_version, v.last_block
            ),
            Message::Reject(r) => {
                format!("cmd {}, code {:?}, reason {}", r.command, r.code, r.reason)
            }
            Message::Ping { nonce } | Message::Pong { nonce } => format!("nonce {}", nonce),
            Message::Addr(list) => format!("{} addr", list.len()),
            Message::Inv(list) | Message::GetData(list) | Message::NotFound(list) => {
                format!("{} inv", list.len())
            }
            Message::Block { payload, .. } | Message::Tx { payload, .. } => {
                format!("{} bytes", payload.len())
            }
            _ => String::new(),
        }
    }
}

/// Framing seam between sessions and the byte stream
#[async_trait]
pub trait WireCodec: Send + Sync + 'static {
    /// Read one message. Returns the number of bytes consumed even on error,
    /// together with the decoded message and its raw payload.
    async fn read_message(
        &self,
        reader: &mut BoxedReader,
        protocol_version: u32,
    ) -> (usize, Result<(Message, Vec<u8>), WireError>);

    /// Write one message, returning the number of bytes written.
    async fn write_message(
        &self,
        writer: &mut BoxedWriter,
        message: &Message,
        protocol_version: u32,
    ) -> Result<usize, WireError>;
}

/// Length-prefixed Borsh framing
#[derive(Debug, Clone)]
pub struct FramedCodec {
    magic: u32,
    max_payload: usize,
}

impl FramedCodec {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            max_payload: MAX_MESSAGE_PAYLOAD,
        }
    }

    /// Encode a message into a complete frame
    pub fn encode_frame(&self, message: &Message) -> Result<Vec<u8>, WireError> {
        let payload = borsh::to_vec(message)
            .map_err(|e| WireError::Malformed(format!("encode {}: {}", message.command(), e)))?;
        if payload.len() > self.max_payload {
            return Err(WireError::Malformed(format!(
                "{} payload of {} bytes exceeds limit",
                message.command(),
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&self.magic.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

impl Default for FramedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAGIC)
    }
}

#[async_trait]
impl WireCodec for FramedCodec {
    async fn read_message(
        &self,
        reader: &mut BoxedReader,
        _protocol_version: u32,
    ) -> (usize, Result<(Message, Vec<u8>), WireError>) {
        let mut header = [0u8; HEADER_LEN];

        // A zero-length read on the first byte is a clean close; anything
        // after that is a torn frame.
        match reader.read(&mut header[..1]).await {
            Ok(0) => return (0, Err(WireError::Closed)),
            Ok(_) => {}
            Err(e) => return (0, Err(WireError::Io(e))),
        }
        if let Err(e) = reader.read_exact(&mut header[1..]).await {
            return (1, Err(WireError::Io(e)));
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != self.magic {
            return (
                HEADER_LEN,
                Err(WireError::Malformed(format!("unexpected network magic {:#010x}", magic))),
            );
        }

        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > self.max_payload {
            return (
                HEADER_LEN,
                Err(WireError::Malformed(format!("payload of {} bytes exceeds limit", len))),
            );
        }

        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            return (HEADER_LEN, Err(WireError::Io(e)));
        }

        let consumed = HEADER_LEN + len;
        match Message::try_from_slice(&payload) {
            Ok(message) => (consumed, Ok((message, payload))),
            Err(e) => (consumed, Err(WireError::Malformed(e.to_string()))),
        }
    }

    async fn write_message(
        &self,
        writer: &mut BoxedWriter,
        message: &Message,
        _protocol_version: u32,
    ) -> Result<usize, WireError> {
        let frame = self.encode_frame(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(frame.len())
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
