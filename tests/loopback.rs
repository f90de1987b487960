//! End-to-end scenarios over real loopback sockets: a server endpoint and a client endpoint
//!  exchanging actual UDP datagrams through the full protocol stack.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use rakudp::{
    DisconnectReason, EndPoint, EventSink, PeerHandle, PeerState, RakNetConfig, Receipt,
    Recipient, Reliability, Role,
};

#[derive(Debug)]
enum SinkEvent {
    Connect(PeerHandle),
    Login(PeerHandle),
    Disconnect(PeerHandle, DisconnectReason),
    Message(PeerHandle, u8, Bytes),
    Acknowledge(Receipt),
    NotAcknowledge(Receipt),
}

struct RecordingSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl RecordingSink {
    fn new() -> (Arc<RecordingSink>, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingSink { tx }), rx)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn on_connect(&self, peer: PeerHandle) -> anyhow::Result<()> {
        self.tx.send(SinkEvent::Connect(peer)).ok();
        Ok(())
    }

    async fn on_login(&self, peer: PeerHandle) -> anyhow::Result<()> {
        self.tx.send(SinkEvent::Login(peer)).ok();
        Ok(())
    }

    async fn on_disconnect(
        &self,
        peer: PeerHandle,
        reason: DisconnectReason,
    ) -> anyhow::Result<()> {
        self.tx.send(SinkEvent::Disconnect(peer, reason)).ok();
        Ok(())
    }

    async fn on_message(
        &self,
        peer: PeerHandle,
        channel: u8,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        self.tx.send(SinkEvent::Message(peer, channel, payload)).ok();
        Ok(())
    }

    async fn on_acknowledge(&self, _peer: PeerHandle, receipt: Receipt) -> anyhow::Result<()> {
        self.tx.send(SinkEvent::Acknowledge(receipt)).ok();
        Ok(())
    }

    async fn on_not_acknowledge(&self, _peer: PeerHandle, receipt: Receipt) -> anyhow::Result<()> {
        self.tx.send(SinkEvent::NotAcknowledge(receipt)).ok();
        Ok(())
    }
}

fn loopback_config() -> RakNetConfig {
    let mut config = RakNetConfig::default_v4();
    config.bind_address = "127.0.0.1:0".parse().unwrap();
    config
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Brings up a server/client pair and completes the login handshake
async fn connected_pair() -> (
    EndPoint,
    mpsc::UnboundedReceiver<SinkEvent>,
    EndPoint,
    mpsc::UnboundedReceiver<SinkEvent>,
    PeerHandle,
) {
    connected_pair_with(loopback_config(), loopback_config()).await
}

async fn connected_pair_with(
    server_config: RakNetConfig,
    client_config: RakNetConfig,
) -> (
    EndPoint,
    mpsc::UnboundedReceiver<SinkEvent>,
    EndPoint,
    mpsc::UnboundedReceiver<SinkEvent>,
    PeerHandle,
) {
    let (server_sink, mut server_rx) = RecordingSink::new();
    let server = EndPoint::new(Role::Server, server_config, server_sink).unwrap();
    server.start().await.unwrap();
    let server_addr = server.local_addr().await.unwrap();

    let (client_sink, mut client_rx) = RecordingSink::new();
    let client = EndPoint::new(Role::Client, client_config, client_sink).unwrap();
    client.start().await.unwrap();

    let server_peer = client.connect(server_addr).await.unwrap();
    assert_eq!(server_peer.address, server_addr);

    // both sides see connect and login, in that order
    assert!(matches!(next_event(&mut client_rx).await, SinkEvent::Connect(_)));
    assert!(matches!(next_event(&mut client_rx).await, SinkEvent::Login(_)));
    assert!(matches!(next_event(&mut server_rx).await, SinkEvent::Connect(_)));
    assert!(matches!(next_event(&mut server_rx).await, SinkEvent::Login(_)));

    (server, server_rx, client, client_rx, server_peer)
}

#[tokio::test]
async fn test_handshake_reaches_logged_in() {
    let (server, _server_rx, client, _client_rx, server_peer) = connected_pair().await;

    assert_eq!(server_peer.guid, server.guid());

    // both peer tables agree on the session
    assert_eq!(
        client.peer_state(Recipient::Peer(server_peer)).await,
        Some(PeerState::LoggedIn)
    );
    let clients = server.connected_peers().await;
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].guid, client.guid());
    assert_eq!(
        server.peer_state(Recipient::Guid(client.guid())).await,
        Some(PeerState::LoggedIn)
    );

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reliable_ordered_roundtrip() {
    let (server, mut server_rx, client, mut client_rx, server_peer) = connected_pair().await;

    for i in 0..10u32 {
        client
            .send_message(
                Recipient::Peer(server_peer),
                Reliability::ReliableOrdered,
                3,
                Bytes::from(format!("m{}", i)),
            )
            .await
            .unwrap();
    }

    let client_handle = server.connected_peers().await[0];
    for i in 0..10u32 {
        match next_event(&mut server_rx).await {
            SinkEvent::Message(peer, channel, payload) => {
                assert_eq!(peer.guid, client_handle.guid);
                assert_eq!(channel, 3);
                assert_eq!(payload, Bytes::from(format!("m{}", i)));
            }
            other => panic!("expected message event, got {:?}", other),
        }
    }

    // and the other direction
    server
        .send_message(
            Recipient::Guid(client.guid()),
            Reliability::ReliableOrdered,
            0,
            Bytes::from_static(b"welcome"),
        )
        .await
        .unwrap();
    match next_event(&mut client_rx).await {
        SinkEvent::Message(_, 0, payload) => assert_eq!(payload, Bytes::from_static(b"welcome")),
        other => panic!("expected message event, got {:?}", other),
    }

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_split_message_delivered_once() {
    let (server, mut server_rx, client, _client_rx, server_peer) = connected_pair().await;

    // 64 KiB forces fragmentation into dozens of datagrams
    let big: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    client
        .send_message(
            Recipient::Peer(server_peer),
            Reliability::Reliable,
            0,
            Bytes::from(big.clone()),
        )
        .await
        .unwrap();

    match timeout(Duration::from_secs(10), server_rx.recv())
        .await
        .expect("timed out waiting for the reassembled message")
        .expect("event channel closed")
    {
        SinkEvent::Message(_, _, payload) => assert_eq!(payload.as_ref(), big.as_slice()),
        other => panic!("expected message event, got {:?}", other),
    }

    // exactly once: nothing else shows up
    assert!(
        timeout(Duration::from_millis(500), server_rx.recv())
            .await
            .is_err(),
        "expected no further deliveries"
    );

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequenced_delivery_is_ascending() {
    let (server, mut server_rx, client, _client_rx, server_peer) = connected_pair().await;

    const COUNT: u32 = 200;
    for i in 0..COUNT {
        client
            .send_message(
                Recipient::Peer(server_peer),
                Reliability::UnreliableSequenced,
                0,
                Bytes::copy_from_slice(&i.to_be_bytes()),
            )
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    loop {
        match timeout(Duration::from_secs(2), server_rx.recv()).await {
            Ok(Some(SinkEvent::Message(_, 0, payload))) => {
                received.push(u32::from_be_bytes(payload.as_ref().try_into().unwrap()));
                if received.last() == Some(&(COUNT - 1)) {
                    break;
                }
            }
            Ok(Some(other)) => panic!("unexpected event {:?}", other),
            _ => break,
        }
    }

    assert!(!received.is_empty());
    // a strictly ascending subsequence of 0..COUNT
    assert!(received.windows(2).all(|w| w[0] < w[1]));
    assert!(received.iter().all(|&i| i < COUNT));

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ack_receipt() {
    let (server, _server_rx, client, mut client_rx, server_peer) = connected_pair().await;

    let receipt = client
        .send_message(
            Recipient::Peer(server_peer),
            Reliability::ReliableWithAckReceipt,
            0,
            Bytes::from_static(b"tell me when it arrived"),
        )
        .await
        .unwrap()
        .expect("ack-receipt reliability must hand out a receipt");

    match next_event(&mut client_rx).await {
        SinkEvent::Acknowledge(acked) => assert_eq!(acked, receipt),
        other => panic!("expected acknowledge event, got {:?}", other),
    }

    // plain reliabilities do not hand out receipts
    let none = client
        .send_message(
            Recipient::Peer(server_peer),
            Reliability::Reliable,
            0,
            Bytes::from_static(b"fire and remember"),
        )
        .await
        .unwrap();
    assert!(none.is_none());

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_disconnect() {
    let (server, mut server_rx, client, mut client_rx, server_peer) = connected_pair().await;

    client.disconnect(Recipient::Peer(server_peer)).await.unwrap();

    match next_event(&mut client_rx).await {
        SinkEvent::Disconnect(_, reason) => {
            assert_eq!(reason, DisconnectReason::Disconnected)
        }
        other => panic!("expected disconnect event, got {:?}", other),
    }
    match next_event(&mut server_rx).await {
        SinkEvent::Disconnect(_, reason) => {
            assert_eq!(reason, DisconnectReason::PeerDisconnected)
        }
        other => panic!("expected disconnect event, got {:?}", other),
    }

    assert!(server.connected_peers().await.is_empty());
    assert!(client.connected_peers().await.is_empty());

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_disconnects_both_sides() {
    let mut server_config = loopback_config();
    server_config.timeout = Duration::from_secs(2);
    let mut client_config = loopback_config();
    client_config.timeout = Duration::from_secs(2);

    let (server, mut server_rx, client, mut client_rx, _server_peer) =
        connected_pair_with(server_config, client_config).await;

    // swallow all inbound traffic on the server: from its point of view the client went dark
    server
        .block(IpAddr::from([127, 0, 0, 1]), Duration::from_secs(60))
        .await;

    match next_event(&mut server_rx).await {
        SinkEvent::Disconnect(_, reason) => assert_eq!(reason, DisconnectReason::Timeout),
        other => panic!("expected disconnect event, got {:?}", other),
    }
    // once the server dropped the peer it stops talking, so the client times out too
    match next_event(&mut client_rx).await {
        SinkEvent::Disconnect(_, reason) => assert_eq!(reason, DisconnectReason::Timeout),
        other => panic!("expected disconnect event, got {:?}", other),
    }

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flood_eviction_blocks_the_address() {
    let mut server_config = loopback_config();
    server_config.max_packets_per_second = 10;
    server_config.flood_block_duration = Duration::from_secs(30);

    let (server, mut server_rx, client, _client_rx, server_peer) =
        connected_pair_with(server_config, loopback_config()).await;

    // many small sends spread over ticks produce well over 10 datagrams per second
    for _ in 0..100 {
        let _ = client
            .send_message(
                Recipient::Peer(server_peer),
                Reliability::Unreliable,
                0,
                Bytes::from_static(b"spam"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let reason = loop {
        match next_event(&mut server_rx).await {
            SinkEvent::Disconnect(_, reason) => break reason,
            _ => continue,
        }
    };
    assert_eq!(reason, DisconnectReason::Flood);
    assert!(server.is_blocked(IpAddr::from([127, 0, 0, 1])).await);
    assert!(server.connected_peers().await.is_empty());

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_full_refuses_connection() {
    let mut server_config = loopback_config();
    server_config.max_connections = 0;
    let mut client_config = loopback_config();
    client_config.connection_timeout = Duration::from_secs(3);

    let (server_sink, _server_rx) = RecordingSink::new();
    let server = EndPoint::new(Role::Server, server_config, server_sink).unwrap();
    server.start().await.unwrap();
    let server_addr = server.local_addr().await.unwrap();

    let (client_sink, _client_rx) = RecordingSink::new();
    let client = EndPoint::new(Role::Client, client_config, client_sink).unwrap();
    client.start().await.unwrap();

    let result = client.connect(server_addr).await;
    match result {
        Err(rakudp::RakNetError::ConnectRefused { reason, .. }) => {
            assert_eq!(reason, "server is full")
        }
        other => panic!("expected a refused connection, got {:?}", other.map(|_| ())),
    }

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_banned_address_is_refused() {
    let mut client_config = loopback_config();
    client_config.connection_timeout = Duration::from_secs(3);

    let (server_sink, _server_rx) = RecordingSink::new();
    let server = EndPoint::new(Role::Server, loopback_config(), server_sink).unwrap();
    server.start().await.unwrap();
    server.ban(IpAddr::from([127, 0, 0, 1])).await;
    let server_addr = server.local_addr().await.unwrap();

    let (client_sink, _client_rx) = RecordingSink::new();
    let client = EndPoint::new(Role::Client, client_config, client_sink).unwrap();
    client.start().await.unwrap();

    let result = client.connect(server_addr).await;
    match result {
        Err(rakudp::RakNetError::ConnectRefused { reason, .. }) => assert_eq!(reason, "banned"),
        other => panic!("expected a refused connection, got {:?}", other.map(|_| ())),
    }

    // after an unban the same client can get in
    server.unban(IpAddr::from([127, 0, 0, 1])).await;
    client.connect(server_addr).await.unwrap();

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}
