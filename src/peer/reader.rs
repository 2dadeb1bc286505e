//! Inbound message loop
//!
//! Reads one message at a time under the negotiation (then idle) deadline,
//! enforces version-first ordering and routes everything else to its
//! handler. Any exit path disconnects the session.

use crate::peer::connection::Peer;
use crate::peer::domain::{PeerEvent, BIP0031_VERSION, NET_ADDRESS_TIME_VERSION};
use crate::peer::wire::{unix_now, BoxedReader, Message, NetAddress, RejectCode};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, trace, warn};

/// Addresses stamped further than this into the future are treated as bogus
const MAX_FUTURE_SKEW_SECS: i64 = 10 * 60;

/// Replacement age for bogus timestamps
const BOGUS_TIMESTAMP_AGE_SECS: i64 = 5 * 24 * 60 * 60;

pub(crate) async fn run(peer: Arc<Peer>, mut reader: BoxedReader) {
    let config = &peer.ctx.config;
    let idle = tokio::time::sleep(config.negotiate_timeout);
    tokio::pin!(idle);

    while !peer.is_disconnecting() {
        let protocol_version = peer.protocol_version();
        let (bytes, result) = tokio::select! {
            biased;
            _ = peer.cancel.cancelled() => break,
            _ = &mut idle => {
                if peer.version_known() {
                    warn!(
                        peer = %peer,
                        idle_secs = config.idle_timeout.as_secs(),
                        "Peer sent nothing within the idle timeout; disconnecting"
                    );
                } else {
                    debug!(peer = %peer, "No version received within the negotiation timeout");
                }
                break;
            }
            read = peer.ctx.codec.read_message(&mut reader, protocol_version) => read,
        };
        peer.stats.lock().bytes_received += bytes as u64;

        let message = match result {
            Ok((message, _raw)) => message,
            Err(err) => {
                if config.regression_test
                    && peer.ctx.regression_policy.tolerates(&err, peer.addr())
                {
                    error!(peer = %peer, error = %err, "Allowed test error");
                    idle.as_mut().reset(tokio::time::Instant::now() + config.idle_timeout);
                    continue;
                }

                if !peer.is_disconnecting() {
                    let reason = format!("Can't read message from {}: {}", peer, err);
                    peer.log_error(&reason);

                    // A clean close has nobody left to tell.
                    if !err.is_clean_close() {
                        peer.push_reject("malformed", RejectCode::Malformed, &reason, None, true)
                            .await;
                    }
                }
                break;
            }
        };

        peer.stats.lock().last_recv = Some(SystemTime::now());
        debug!(
            peer = %peer,
            command = message.command(),
            summary = %message.summary(),
            "Received message"
        );

        if !matches!(message, Message::Version(_)) && !peer.version_known() {
            let reason = "A version message must precede all others";
            peer.log_error(reason);
            peer.push_reject(message.command(), RejectCode::Malformed, reason, None, true)
                .await;
            break;
        }

        if !dispatch(&peer, message).await {
            break;
        }

        idle.as_mut().reset(tokio::time::Instant::now() + config.idle_timeout);
    }

    peer.disconnect();
    peer.ctx.emit(PeerEvent::Done(peer.clone()));

    // Only sessions announced to the block manager are retracted.
    if peer.version_known() {
        peer.ctx.block_manager.notify_session_ended(peer.clone()).await;
    }

    drop(reader);
    trace!(peer = %peer, "Peer input handler done");
    peer.task_exited();
}

/// Route one message. Returns false when the session must end.
async fn dispatch(peer: &Arc<Peer>, message: Message) -> bool {
    match message {
        Message::Version(msg) => peer.handle_version(msg).await,
        Message::VerAck => return peer.handle_verack(),
        Message::GetAddr => peer.handle_get_addr().await,
        Message::Addr(list) => peer.handle_addr(list),
        Message::Ping { nonce } => peer.handle_ping(nonce).await,
        Message::Pong { nonce } => peer.handle_pong(nonce),
        Message::Inv(list) => {
            peer.ctx
                .block_manager
                .handle_inventory_announcement(list, peer.clone())
                .await
        }
        data @ (Message::GetData(_)
        | Message::NotFound(_)
        | Message::Block { .. }
        | Message::Tx { .. }) => {
            peer.ctx
                .block_manager
                .handle_data_message(data, peer.clone())
                .await
        }
        Message::Reject(reject) => {
            debug!(
                peer = %peer,
                command = %reject.command,
                code = ?reject.code,
                reason = %reject.reason,
                "Peer rejected a message"
            );
        }
        // Alerts are deprecated; just note them.
        Message::Alert(payload) => trace!(peer = %peer, len = payload.len(), "Ignoring alert"),
    }
    true
}

impl Peer {
    async fn handle_get_addr(&self) {
        // Simulation networks stay isolated.
        if self.ctx.config.sim_net {
            return;
        }

        // Only answer inbound peers, so outbound connections can't be used
        // to fingerprint us.
        if !self.inbound() {
            return;
        }

        let cache = self.ctx.address_book.address_cache();
        self.push_addr(cache).await;
    }

    fn handle_addr(&self, mut addresses: Vec<NetAddress>) {
        if self.ctx.config.sim_net {
            return;
        }

        // Older peers send addresses without timestamps; ignore them.
        if self.protocol_version() < NET_ADDRESS_TIME_VERSION {
            return;
        }

        if addresses.is_empty() {
            self.log_error(&format!("Command [addr] from {} does not contain any addresses", self));
            self.disconnect();
            return;
        }

        let now = unix_now();
        {
            let mut known = self.known_addresses.lock();
            for na in addresses.iter_mut() {
                if self.is_disconnecting() {
                    return;
                }
                if na.timestamp > now + MAX_FUTURE_SKEW_SECS {
                    na.timestamp = now - BOGUS_TIMESTAMP_AGE_SECS;
                }
                known.insert(na.key());
            }
        }

        let source = self.net_address().unwrap_or_else(NetAddress::unroutable);
        self.ctx.address_book.add_addresses(&addresses, &source);
    }

    async fn handle_ping(&self, nonce: u64) {
        // Older peers don't expect a pong.
        if self.protocol_version() > BIP0031_VERSION {
            self.enqueue_message(Message::Pong { nonce }, None).await;
        }
    }

    fn handle_pong(&self, nonce: u64) {
        let mut stats = self.stats.lock();
        if stats.protocol_version <= BIP0031_VERSION || stats.last_ping_nonce == 0 {
            return;
        }
        if nonce != stats.last_ping_nonce {
            return;
        }
        if let Some(sent) = stats.last_ping_time {
            stats.last_ping_micros = i64::try_from(sent.elapsed().as_micros()).unwrap_or(i64::MAX);
        }
        stats.last_ping_nonce = 0;
    }

    pub(crate) fn record_ping(&self, nonce: u64) {
        let mut stats = self.stats.lock();
        if stats.protocol_version > BIP0031_VERSION {
            stats.last_ping_nonce = nonce;
            stats.last_ping_time = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::collaborators::{
        LoggingBlockManager, MemoryAddressBook, MockAddressBook, MockBlockManager,
        TolerateMalformed,
    };
    use crate::peer::connection::PeerContext;
    use crate::peer::domain::{PeerConfig, PROTOCOL_VERSION};
    use crate::peer::session::SessionState;
    use crate::peer::wire::{
        BoxedWriter, FramedCodec, InvType, InvVect, MsgVersion, ServiceFlags, WireCodec,
        DEFAULT_MAGIC,
    };
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn peer_with_book(
        config: PeerConfig,
        book: Arc<dyn crate::peer::collaborators::AddressBook>,
        inbound: bool,
    ) -> Arc<Peer> {
        let (ctx, _events) = PeerContext::new(config, book, Arc::new(LoggingBlockManager::new(0)));
        // Handlers are called directly; no tasks read the stream.
        let (local, _remote) = tokio::io::duplex(1024);
        let addr = "10.0.0.1:8108".parse().unwrap();
        let peer = Peer::with_stream(Arc::new(ctx), local, addr, inbound);
        peer.stats.lock().version_known = true;
        peer
    }

    fn na(addr: &str, timestamp: i64) -> NetAddress {
        let mut na = NetAddress::new(addr.parse().unwrap(), ServiceFlags::NODE_NETWORK);
        na.timestamp = timestamp;
        na
    }

    #[tokio::test]
    async fn test_addr_restamps_future_timestamps() {
        let mut book = MockAddressBook::new();
        let now = unix_now();
        book.expect_add_addresses()
            .withf(move |addrs, source| {
                source.key() == "10.0.0.1:8108"
                    && addrs.len() == 2
                    && addrs[0].timestamp <= now - BOGUS_TIMESTAMP_AGE_SECS + 5
                    && addrs[1].timestamp == now - 60
            })
            .times(1)
            .return_const(());
        book.expect_mark_connected().return_const(());

        let peer = peer_with_book(PeerConfig::default(), Arc::new(book), false);
        peer.handle_addr(vec![
            na("10.1.1.1:8108", now + 3600),
            na("10.1.1.2:8108", now - 60),
        ]);

        assert!(peer.known_addresses.lock().contains("10.1.1.1:8108"));
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_empty_addr_disconnects() {
        let book = Arc::new(MemoryAddressBook::new(10));
        let peer = peer_with_book(PeerConfig::default(), book, false);
        peer.handle_addr(Vec::new());
        assert!(peer.is_disconnecting());
    }

    #[tokio::test]
    async fn test_addr_ignored_on_simnet_and_old_peers() {
        let mut book = MockAddressBook::new();
        book.expect_add_addresses().times(0);
        book.expect_mark_connected().return_const(());
        let book = Arc::new(book);

        let sim = PeerConfig {
            sim_net: true,
            ..PeerConfig::default()
        };
        let peer = peer_with_book(sim, book.clone(), false);
        peer.handle_addr(vec![na("10.1.1.1:8108", 0)]);

        let peer = peer_with_book(PeerConfig::default(), book, false);
        peer.stats.lock().protocol_version = NET_ADDRESS_TIME_VERSION - 1;
        peer.handle_addr(vec![na("10.1.1.1:8108", 0)]);
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_get_addr_only_answered_for_inbound() {
        let mut book = MockAddressBook::new();
        book.expect_address_cache().times(1).returning(Vec::new);
        let book = Arc::new(book);

        let outbound = peer_with_book(PeerConfig::default(), book.clone(), false);
        outbound.handle_get_addr().await;

        let inbound = peer_with_book(PeerConfig::default(), book, true);
        inbound.handle_get_addr().await;
    }

    #[tokio::test]
    async fn test_pong_records_round_trip() {
        let book = Arc::new(MemoryAddressBook::new(10));
        let peer = peer_with_book(PeerConfig::default(), book, true);
        peer.record_ping(77);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Wrong nonce leaves the ping outstanding.
        peer.handle_pong(78);
        assert_eq!(peer.stats.lock().last_ping_nonce, 77);

        peer.handle_pong(77);
        let stats = peer.stats.lock();
        assert_eq!(stats.last_ping_nonce, 0);
        assert!(stats.last_ping_micros >= 5_000);
    }

    #[tokio::test]
    async fn test_pong_ignored_for_old_protocol() {
        let book = Arc::new(MemoryAddressBook::new(10));
        let peer = peer_with_book(PeerConfig::default(), book, true);
        peer.stats.lock().protocol_version = BIP0031_VERSION;
        peer.record_ping(77);
        peer.handle_pong(77);
        assert_eq!(peer.ping_micros(), 0);
    }

    fn peer_with_block_manager(config: PeerConfig, block_manager: MockBlockManager) -> Arc<Peer> {
        let (ctx, _events) = PeerContext::new(
            config,
            Arc::new(MemoryAddressBook::new(10)),
            Arc::new(block_manager),
        );
        // The reader under test gets its own stream; this one stays idle.
        let (local, _remote) = tokio::io::duplex(1024);
        Peer::with_stream(Arc::new(ctx), local, "10.0.0.1:8108".parse().unwrap(), true)
    }

    fn inv(n: u8) -> InvVect {
        InvVect::new(InvType::Block, [n; 32])
    }

    #[tokio::test]
    async fn test_inventory_and_data_reach_block_manager() {
        let mut block_manager = MockBlockManager::new();
        block_manager
            .expect_handle_inventory_announcement()
            .withf(|list, _| list == &vec![inv(1), inv(2)])
            .times(1)
            .return_const(());
        block_manager
            .expect_handle_data_message()
            .withf(|message, _| matches!(message, Message::GetData(list) if list.len() == 1))
            .times(1)
            .return_const(());
        block_manager
            .expect_handle_data_message()
            .withf(|message, _| {
                matches!(message, Message::Block { hash, .. } if *hash == [3u8; 32])
            })
            .times(1)
            .return_const(());

        let peer = peer_with_block_manager(PeerConfig::default(), block_manager);
        peer.stats.lock().version_known = true;

        assert!(dispatch(&peer, Message::Inv(vec![inv(1), inv(2)])).await);
        assert!(dispatch(&peer, Message::GetData(vec![inv(1)])).await);
        let block = Message::Block {
            hash: [3u8; 32],
            payload: vec![1, 2, 3],
        };
        assert!(dispatch(&peer, block).await);
        peer.shutdown();
    }

    #[tokio::test]
    async fn test_negotiated_session_end_is_announced() {
        let mut block_manager = MockBlockManager::new();
        block_manager
            .expect_notify_session_ended()
            .withf(|peer| peer.is_disconnecting())
            .times(1)
            .return_const(());

        let peer = peer_with_block_manager(PeerConfig::default(), block_manager);
        peer.stats.lock().version_known = true;

        let (session_side, remote) = tokio::io::duplex(1024);
        drop(remote);
        tokio::time::timeout(Duration::from_secs(5), run(peer.clone(), Box::new(session_side)))
            .await
            .expect("reader did not exit on close");
        assert!(peer.is_disconnecting());
    }

    #[tokio::test]
    async fn test_unnegotiated_session_end_is_not_announced() {
        let mut block_manager = MockBlockManager::new();
        block_manager.expect_notify_session_ended().times(0);
        block_manager.expect_handle_inventory_announcement().times(0);

        let config = PeerConfig {
            reject_deadline: Duration::from_millis(50),
            ..PeerConfig::default()
        };
        let peer = peer_with_block_manager(config, block_manager);

        let (session_side, remote) = tokio::io::duplex(64 * 1024);
        let (_remote_read, remote_write) = tokio::io::split(remote);
        let mut remote_writer: BoxedWriter = Box::new(remote_write);

        // Inventory ahead of the version ends the session before any handler runs.
        FramedCodec::default()
            .write_message(&mut remote_writer, &Message::Inv(vec![inv(1)]), PROTOCOL_VERSION)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), run(peer.clone(), Box::new(session_side)))
            .await
            .expect("reader did not exit");
        assert!(peer.is_disconnecting());
        assert!(!peer.version_known());
    }

    fn remote_version(nonce: u64) -> Message {
        let na = NetAddress::new("10.0.0.1:8108".parse().unwrap(), ServiceFlags::NODE_NETWORK);
        Message::Version(MsgVersion::new(na.clone(), na, nonce, 0))
    }

    async fn garbage_frame(writer: &mut BoxedWriter) {
        let mut frame = Vec::new();
        frame.extend_from_slice(&DEFAULT_MAGIC.to_le_bytes());
        frame.extend_from_slice(&3u32.to_le_bytes());
        frame.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        writer.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_regression_mode_survives_malformed_frame() {
        let config = PeerConfig {
            regression_test: true,
            ..PeerConfig::default()
        };
        let (ctx, _events) = PeerContext::new(
            config,
            Arc::new(MemoryAddressBook::new(10)),
            Arc::new(LoggingBlockManager::new(0)),
        );
        let ctx = Arc::new(ctx.with_regression_policy(Arc::new(TolerateMalformed)));
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = Peer::with_stream(ctx, local, "10.0.0.1:8108".parse().unwrap(), true);
        peer.start().await.unwrap();

        let codec = FramedCodec::default();
        let (remote_read, remote_write) = tokio::io::split(remote);
        let mut remote_reader: BoxedReader = Box::new(remote_read);
        let mut remote_writer: BoxedWriter = Box::new(remote_write);

        garbage_frame(&mut remote_writer).await;
        codec
            .write_message(&mut remote_writer, &remote_version(42), PROTOCOL_VERSION)
            .await
            .unwrap();

        // The session answers the version as if nothing happened.
        let mut replies = Vec::new();
        while replies.len() < 2 {
            let (_, result) = tokio::time::timeout(
                Duration::from_secs(5),
                codec.read_message(&mut remote_reader, PROTOCOL_VERSION),
            )
            .await
            .expect("timed out waiting for a reply");
            replies.push(result.unwrap().0);
        }
        assert!(matches!(replies[0], Message::Version(_)));
        assert_eq!(replies[1], Message::VerAck);

        codec
            .write_message(&mut remote_writer, &Message::VerAck, PROTOCOL_VERSION)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while peer.state() != SessionState::Negotiated {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never negotiated");
        peer.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal_outside_regression_mode() {
        let (ctx, _events) = PeerContext::new(
            PeerConfig::default(),
            Arc::new(MemoryAddressBook::new(10)),
            Arc::new(LoggingBlockManager::new(0)),
        );
        let ctx = Arc::new(ctx.with_regression_policy(Arc::new(TolerateMalformed)));
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = Peer::with_stream(ctx, local, "10.0.0.1:8108".parse().unwrap(), true);
        peer.start().await.unwrap();

        let (_remote_read, remote_write) = tokio::io::split(remote);
        let mut remote_writer: BoxedWriter = Box::new(remote_write);
        garbage_frame(&mut remote_writer).await;

        tokio::time::timeout(Duration::from_secs(5), peer.wait_closed())
            .await
            .expect("session survived a malformed frame");
        assert!(!peer.version_known());
    }
}
