use crate::helpers::{
    create_test_node, negotiated_outbound, remote_version, start_manager, wait_until, RawRemote,
    REMOTE_NONCE,
};
use p2p_peer_session::peer::{
    domain::{PeerConfig, PROTOCOL_VERSION},
    wire::RejectCode,
    InvType, InvVect, LoggingBlockManager, MemoryAddressBook, Message, PeerContext, SessionState,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_two_nodes_negotiate() {
    let server = create_test_node(PeerConfig::default());
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();

    let client = create_test_node(PeerConfig::default());
    let outbound = client.connect(&server_addr.to_string(), false).unwrap();

    wait_until("client negotiated", || outbound.state() == SessionState::Negotiated).await;
    wait_until("server negotiated", || {
        server
            .peers()
            .iter()
            .any(|p| p.state() == SessionState::Negotiated)
    })
    .await;

    let inbound = server.peers().pop().unwrap();
    assert!(inbound.inbound());
    assert!(!outbound.inbound());
    assert!(inbound.id() > 0);
    assert!(outbound.id() > 0);
    assert_eq!(inbound.protocol_version(), PROTOCOL_VERSION);
    assert_eq!(outbound.protocol_version(), PROTOCOL_VERSION);
    assert!(inbound.handshake_complete());
    assert!(outbound.handshake_complete());
    assert_eq!(outbound.retry_count(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_first_message_must_be_version() {
    let server = create_test_node(PeerConfig::default());
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut remote = RawRemote::connect(server_addr).await;
    remote.send(&Message::Ping { nonce: 1 }).await;

    match remote.recv().await.unwrap() {
        Message::Reject(reject) => {
            assert_eq!(reject.command, "ping");
            assert_eq!(reject.code, RejectCode::Malformed);
        }
        other => panic!("expected reject, got {:?}", other),
    }
    remote.expect_closed().await;

    wait_until("session removed", || server.peer_count() == 0).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_self_connection_is_dropped() {
    let (ctx, events) = PeerContext::new(
        PeerConfig::default(),
        Arc::new(MemoryAddressBook::new(10)),
        Arc::new(LoggingBlockManager::new(0)),
    );
    let server = start_manager(ctx.with_nonce(REMOTE_NONCE), events);
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut remote = RawRemote::connect(server_addr).await;
    remote
        .send(&remote_version(PROTOCOL_VERSION, REMOTE_NONCE))
        .await;

    // No version, no verack: the session just goes away.
    assert!(remote.recv().await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_obsolete_version_is_rejected() {
    let server = create_test_node(PeerConfig::default());
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut remote = RawRemote::connect(server_addr).await;
    remote.send(&remote_version(100, REMOTE_NONCE)).await;

    match remote.recv().await.unwrap() {
        Message::Reject(reject) => {
            assert_eq!(reject.command, "version");
            assert_eq!(reject.code, RejectCode::Obsolete);
            assert!(reject.reason.contains("209"));
        }
        other => panic!("expected reject, got {:?}", other),
    }
    remote.expect_closed().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_version_is_rejected() {
    let client = create_test_node(PeerConfig::default());
    let (peer, mut remote) = negotiated_outbound(&client).await;

    remote
        .send(&remote_version(PROTOCOL_VERSION, REMOTE_NONCE))
        .await;
    match remote
        .recv_matching(|m| matches!(m, Message::Reject(_)))
        .await
    {
        Message::Reject(reject) => assert_eq!(reject.code, RejectCode::Duplicate),
        _ => unreachable!(),
    }
    remote.expect_closed().await;
    peer.wait_closed().await;
    assert_eq!(peer.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_ping_is_answered() {
    let client = create_test_node(PeerConfig::default());
    let (peer, mut remote) = negotiated_outbound(&client).await;
    assert_eq!(peer.user_agent(), "/raw-remote:0.1/");

    remote.send(&Message::Ping { nonce: 4242 }).await;
    let pong = remote
        .recv_matching(|m| matches!(m, Message::Pong { .. }))
        .await;
    assert_eq!(pong, Message::Pong { nonce: 4242 });
    assert!(peer.bytes_received() > 0);
    assert!(peer.bytes_sent() > 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_enqueue_keeps_framing_intact() {
    let client = create_test_node(PeerConfig::default());
    let (peer, mut remote) = negotiated_outbound(&client).await;

    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let peer = peer.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..50u64 {
                peer.enqueue_message(Message::Ping { nonce: worker * 1000 + n + 1 }, None)
                    .await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut seen = HashSet::new();
    while seen.len() < 400 {
        if let Message::Ping { nonce } = remote
            .recv_matching(|m| matches!(m, Message::Ping { .. }))
            .await
        {
            assert!(seen.insert(nonce), "nonce {} delivered twice", nonce);
        }
    }

    let expected: HashSet<u64> = (0..8u64)
        .flat_map(|w| (0..50u64).map(move |n| w * 1000 + n + 1))
        .collect();
    assert_eq!(seen, expected);
    client.shutdown().await;
}

#[tokio::test]
async fn test_inventory_is_trickled_once() {
    let config = PeerConfig {
        trickle_interval: Duration::from_millis(100),
        ..PeerConfig::default()
    };
    let client = create_test_node(config);
    let (peer, mut remote) = negotiated_outbound(&client).await;

    let block = InvVect::new(InvType::Block, [1u8; 32]);
    let tx = InvVect::new(InvType::Tx, [2u8; 32]);
    peer.enqueue_inventory(block).await;
    peer.enqueue_inventory(tx).await;
    peer.enqueue_inventory(block).await;

    match remote
        .recv_matching(|m| matches!(m, Message::Inv(_)))
        .await
    {
        Message::Inv(list) => assert_eq!(list, vec![block, tx]),
        _ => unreachable!(),
    }
    assert!(peer.is_known_inventory(&block));
    assert!(peer.is_known_inventory(&tx));

    client.shutdown().await;
}
