//! Stream and datagram framing, close semantics and disconnect reporting

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use peerlink::config::TransportConfig;
use peerlink::error::ProtocolError;
use peerlink::transport::{memory, Connection, DisconnectReason};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Install a handler forwarding every message into a channel
fn collect(connection: &Connection) -> mpsc::UnboundedReceiver<Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    connection.set_handler(move |message: Bytes, _: &Connection| {
        let _ = tx.send(message);
    });
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

async fn tcp_pair(config: &TransportConfig) -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (server_stream, _) = accepted.unwrap();
    (Connection::from_tcp(server_stream, config), client.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_frame_over_tcp() {
    let (connection, mut raw) = tcp_pair(&TransportConfig::default()).await;
    let mut rx = collect(&connection);

    raw.write_all(&[0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o'])
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.as_ref(), b"hello");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "exactly one message expected");
}

#[tokio::test]
async fn test_connect_tcp_pair() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = TransportConfig::default();

    let (client, accepted) = tokio::join!(Connection::connect_tcp(addr, &config), listener.accept());
    let client = client.unwrap();
    let server = Connection::from_tcp(accepted.unwrap().0, &config);
    assert_eq!(client.peer_addr(), Some(addr));
    assert_eq!(server.peer_addr(), client.local_addr());

    let mut rx = collect(&server);
    client.write_message(Bytes::from_static(b"over tcp")).unwrap();
    assert_eq!(recv(&mut rx).await.as_ref(), b"over tcp");
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let (connection, mut raw) = tcp_pair(&TransportConfig::default()).await;
    let mut rx = collect(&connection);

    raw.write_all(&[0x05, 0x00]).await.unwrap();
    raw.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.write_all(&[0x00, 0x00, b'h', b'e']).await.unwrap();
    raw.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.write_all(&[b'l', b'l', b'o', 0x00, 0x00, 0x00, 0x00]).await.unwrap();

    assert_eq!(recv(&mut rx).await.as_ref(), b"hello");
    assert!(recv(&mut rx).await.is_empty());
}

#[tokio::test]
async fn test_memory_pair_roundtrip() {
    let (left, right) = memory::default_pair();
    let mut rx = collect(&right);

    left.write_message(Bytes::from_static(b"one")).unwrap();
    left.write_message(Bytes::from_static(b"")).unwrap();
    left.write_message(vec![7u8; 100_000]).unwrap();

    assert_eq!(recv(&mut rx).await.as_ref(), b"one");
    assert!(recv(&mut rx).await.is_empty());
    assert_eq!(recv(&mut rx).await.len(), 100_000);
}

#[tokio::test]
async fn test_messages_buffer_until_handler_installed() {
    let (left, right) = memory::default_pair();
    for i in 0..5u8 {
        left.write_message(vec![i]).unwrap();
    }

    tokio::time::timeout(WAIT, async {
        while right.pending_messages() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages should be buffered");

    let mut rx = collect(&right);
    for i in 0..5u8 {
        assert_eq!(recv(&mut rx).await.as_ref(), &[i]);
    }
}

#[tokio::test]
async fn test_oversized_frame_disconnects() {
    let config = TransportConfig {
        max_frame_size: 16,
        ..TransportConfig::default()
    };
    let (connection, mut raw) = tcp_pair(&config).await;
    let _rx = collect(&connection);

    raw.write_all(&1000u32.to_le_bytes()).await.unwrap();

    tokio::time::timeout(WAIT, connection.closed())
        .await
        .expect("connection should close");
    assert!(matches!(
        connection.disconnect_reason(),
        Some(DisconnectReason::Protocol(_))
    ));
}

#[tokio::test]
async fn test_oversized_write_rejected() {
    let config = TransportConfig {
        max_frame_size: 8,
        ..TransportConfig::default()
    };
    let (left, _right) = memory::pair(&config);
    let result = left.write_message(vec![0u8; 9]);
    assert!(matches!(result, Err(ProtocolError::OversizedPacket(9))));
    assert!(!left.is_closed());
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let (left, _right) = memory::default_pair();
    left.close();
    assert!(left.is_closed());
    assert!(matches!(
        left.write_message(Bytes::from_static(b"late")),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(left.disconnect_reason(), Some(DisconnectReason::LocalClose));
}

#[tokio::test]
async fn test_queued_writes_flushed_before_close() {
    let (left, right) = memory::default_pair();
    let mut rx = collect(&right);

    for i in 0..10u8 {
        left.write_message(vec![i]).unwrap();
    }
    left.close();

    for i in 0..10u8 {
        assert_eq!(recv(&mut rx).await.as_ref(), &[i]);
    }
    tokio::time::timeout(WAIT, right.closed())
        .await
        .expect("peer should observe the close");
    assert_eq!(right.disconnect_reason(), Some(DisconnectReason::PeerClosed));
}

#[tokio::test]
async fn test_disconnect_listener_fires_once() {
    let (left, right) = memory::default_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let tx_clone = tx.clone();
    right.on_disconnect(move |_, reason| {
        let _ = tx_clone.send(reason.clone());
    });
    left.close();
    right.close();
    right.close();

    let reason = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(
        reason,
        DisconnectReason::PeerClosed | DisconnectReason::LocalClose
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    // Registering after the fact fires immediately with the recorded reason
    right.on_disconnect(move |_, reason| {
        let _ = tx.send(reason.clone());
    });
    assert_eq!(rx.try_recv().ok(), right.disconnect_reason());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_last_handle_ends_the_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = TransportConfig::default();
    let (client, accepted) = tokio::join!(Connection::connect_tcp(addr, &config), listener.accept());
    let client = client.unwrap();
    let (mut raw, _) = accepted.unwrap();

    client.write_message(Bytes::from_static(b"bye")).unwrap();
    let handle = client.clone();
    drop(client);
    drop(handle);

    // Queued frames are flushed, then the peer reads end of stream
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, raw.read_to_end(&mut received))
        .await
        .expect("peer never saw end of stream")
        .unwrap();
    assert_eq!(received, [3, 0, 0, 0, b'b', b'y', b'e']);
}

#[tokio::test]
async fn test_dropped_peer_is_reported_as_closed() {
    let (left, right) = memory::default_pair();
    let _rx = collect(&right);
    drop(left);

    tokio::time::timeout(WAIT, right.closed()).await.unwrap();
    assert_eq!(right.disconnect_reason(), Some(DisconnectReason::PeerClosed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accepted_writes_survive_a_racing_close() {
    for _ in 0..10 {
        let (left, right) = memory::default_pair();
        let mut rx = collect(&right);

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let left = left.clone();
                tokio::spawn(async move {
                    let mut accepted = 0usize;
                    while left.write_message(Bytes::from_static(b"x")).is_ok() {
                        accepted += 1;
                        if accepted % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    accepted
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        left.close();

        let mut accepted = 0;
        for writer in writers {
            accepted += writer.await.unwrap();
        }
        // Every write that returned Ok reaches the peer
        for _ in 0..accepted {
            recv(&mut rx).await;
        }
        tokio::time::timeout(WAIT, right.closed()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "more messages arrived than were accepted");
    }
}

#[tokio::test]
async fn test_removed_listener_does_not_fire() {
    let (left, _right) = memory::default_pair();
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let subscription = left.on_disconnect(move |_, _| {
        let _ = tx.send(());
    });
    assert!(left.remove_disconnect_listener(subscription));
    left.close();

    assert!(rx.recv().await.is_none());
}

async fn udp_socket() -> (Arc<UdpSocket>, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (Arc::new(socket), addr)
}

#[tokio::test]
async fn test_datagram_roundtrip() {
    let (a_socket, a_addr) = udp_socket().await;
    let (b_socket, b_addr) = udp_socket().await;
    let config = TransportConfig::default();

    let a = Connection::from_datagram(a_socket, b_addr, &config);
    let b = Connection::from_datagram(b_socket, a_addr, &config);
    let mut rx = collect(&b);

    a.write_message(Bytes::from_static(b"ping")).unwrap();
    assert_eq!(recv(&mut rx).await.as_ref(), b"ping");
}

#[tokio::test]
async fn test_connect_udp() {
    let (peer, peer_addr) = udp_socket().await;
    let config = TransportConfig::default();
    let connection = Connection::connect_udp("127.0.0.1:0".parse().unwrap(), peer_addr, &config)
        .await
        .unwrap();
    let local = connection.local_addr().unwrap();

    connection.write_message(Bytes::from_static(b"out")).unwrap();
    let mut buf = [0u8; 16];
    let (len, from) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"out");
    assert_eq!(from, local);

    let mut rx = collect(&connection);
    peer.send_to(b"back", local).await.unwrap();
    assert_eq!(recv(&mut rx).await.as_ref(), b"back");
}

#[tokio::test]
async fn test_datagram_drops_foreign_endpoint() {
    let (bound_socket, bound_addr) = udp_socket().await;
    let (peer_socket, peer_addr) = udp_socket().await;
    let (stranger, _) = udp_socket().await;
    let config = TransportConfig::default();

    let connection = Connection::from_datagram(bound_socket, peer_addr, &config);
    let mut rx = collect(&connection);

    stranger.send_to(b"intruder", bound_addr).await.unwrap();
    stranger.send_to(b"", bound_addr).await.unwrap();
    peer_socket.send_to(b"", bound_addr).await.unwrap();
    peer_socket.send_to(b"friend", bound_addr).await.unwrap();

    assert_eq!(recv(&mut rx).await.as_ref(), b"friend");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_datagram_payload_ceiling() {
    let (socket, _) = udp_socket().await;
    let (_, remote) = udp_socket().await;
    let connection = Connection::from_datagram(socket, remote, &TransportConfig::default());

    assert_eq!(connection.max_payload(), 59_900);
    assert!(connection.write_message(vec![0u8; 59_900]).is_ok());
    assert!(matches!(
        connection.write_message(vec![0u8; 59_901]),
        Err(ProtocolError::OversizedPacket(59_901))
    ));
}

#[tokio::test]
async fn test_send_to_reaches_other_endpoint() {
    let (socket, _) = udp_socket().await;
    let (_, remote) = udp_socket().await;
    let (other, other_addr) = udp_socket().await;
    let connection = Connection::from_datagram(socket, remote, &TransportConfig::default());

    connection
        .send_to(Bytes::from_static(b"direct"), other_addr)
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(WAIT, other.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"direct");
}

#[tokio::test]
async fn test_send_to_rejected_on_stream() {
    let (left, _right) = memory::default_pair();
    let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(matches!(
        left.send_to(Bytes::from_static(b"x"), target),
        Err(ProtocolError::InvalidState(_))
    ));
}
