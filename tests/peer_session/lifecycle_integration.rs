use crate::helpers::{
    create_test_node, negotiated_outbound, remote_version, wait_until, RawRemote, REMOTE_NONCE,
    STEP_TIMEOUT,
};
use p2p_peer_session::peer::{domain::PeerConfig, retry_delay, Message, SessionState};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

#[tokio::test]
async fn test_shutdown_releases_every_waiter() {
    let client = create_test_node(PeerConfig::default());
    let (peer, remote) = negotiated_outbound(&client).await;

    // The remote stops reading, so large payloads back up behind the socket.
    let mut waiters = Vec::new();
    for n in 0..20u8 {
        let (tx, rx) = oneshot::channel();
        let message = Message::Block {
            hash: [n; 32],
            payload: vec![n; 512 * 1024],
        };
        let sender = peer.clone();
        tokio::spawn(async move { sender.enqueue_message(message, Some(tx)).await });
        waiters.push(rx);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    peer.shutdown();
    for rx in waiters {
        timeout(STEP_TIMEOUT, rx)
            .await
            .expect("completion signal never fired")
            .unwrap();
    }
    timeout(STEP_TIMEOUT, peer.wait_closed())
        .await
        .expect("session never closed");
    assert_eq!(peer.state(), SessionState::Closed);
    drop(remote);
}

#[tokio::test]
async fn test_persistent_peer_is_redialed() {
    let config = PeerConfig {
        connection_retry_interval: Duration::from_millis(100),
        ..PeerConfig::default()
    };
    let client = create_test_node(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let first = client.connect(&addr, true).unwrap();
    assert!(first.persistent());
    let (stream, _) = timeout(STEP_TIMEOUT, listener.accept()).await.unwrap().unwrap();
    drop(stream);

    let (stream, _) = timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("persistent peer was not redialed")
        .unwrap();

    wait_until("replacement registered", || {
        client
            .peers()
            .iter()
            .any(|p| p.addr() == addr && p.retry_count() == 1)
    })
    .await;
    assert_eq!(client.peer_count(), 1);

    drop(stream);
    client.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_persistent_peer_backs_off() {
    let config = PeerConfig {
        connection_retry_interval: Duration::from_millis(40),
        max_connection_retry_interval: Duration::from_millis(80),
        ..PeerConfig::default()
    };
    let client = create_test_node(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    client.connect(&addr, true).unwrap();
    wait_until("several redials", || {
        client.peers().iter().any(|p| p.retry_count() >= 3)
    })
    .await;

    assert_eq!(
        retry_delay(Duration::from_millis(40), Duration::from_millis(80), 3),
        Duration::from_millis(60)
    );
    client.shutdown().await;
    assert_eq!(client.peer_count(), 0);
}

#[tokio::test]
async fn test_silent_peer_hits_negotiation_timeout() {
    let config = PeerConfig {
        negotiate_timeout: Duration::from_millis(200),
        ..PeerConfig::default()
    };
    let server = create_test_node(config);
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut remote = RawRemote::connect(server_addr).await;
    remote.expect_closed().await;
    wait_until("session removed", || server.peer_count() == 0).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_outdated_peer_is_banned() {
    let server = create_test_node(PeerConfig::default());
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut remote = RawRemote::connect(server_addr).await;
    remote.send(&remote_version(70001, REMOTE_NONCE)).await;
    remote.expect_closed().await;

    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    wait_until("ip banned", || server.is_banned(&loopback)).await;

    // Later connections from the same address are refused outright.
    let mut again = RawRemote::connect(server_addr).await;
    again.expect_closed().await;
    wait_until("no sessions", || server.peer_count() == 0).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_manager_shutdown_closes_both_sides() {
    let server = create_test_node(PeerConfig::default());
    let server_addr = server.listen("127.0.0.1:0").await.unwrap();
    let client = create_test_node(PeerConfig::default());
    let outbound = client.connect(&server_addr.to_string(), true).unwrap();

    wait_until("negotiated", || outbound.state() == SessionState::Negotiated).await;
    wait_until("server sees the peer", || server.peer_count() == 1).await;

    client.shutdown().await;
    assert_eq!(outbound.state(), SessionState::Closed);
    assert_eq!(client.peer_count(), 0);

    // The persistent flag must not resurrect anything after shutdown.
    wait_until("server side cleaned up", || server.peer_count() == 0).await;
    assert!(client.connect(&server_addr.to_string(), true).is_err());
    server.shutdown().await;
}
