//! Server lifecycle: sources, negotiation, client tracking and shutdown

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use peerlink::config::{NetworkConfig, TransportConfig};
use peerlink::error::{ProtocolError, Result, ValidationFailure};
use peerlink::negotiation::{validate_connection, NameValidator, Position, Validator};
use peerlink::protocol::{MessageContext, ProtocolConnection, ProtocolDefinition};
use peerlink::serialization::Registry;
use peerlink::service::{ChannelSource, ProtocolServer, Server, ServerEvent};
use peerlink::transport::{memory, Connection, DisconnectReason, MessageHandler};
use peerlink::wire_message;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

fn names(words: &[&str]) -> Vec<Arc<dyn Validator>> {
    words
        .iter()
        .map(|word| Arc::new(NameValidator::new(word)) as Arc<dyn Validator>)
        .collect()
}

async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a server event")
        .expect("event channel closed")
}

async fn expect_validated(events: &mut broadcast::Receiver<ServerEvent>) -> Connection {
    match next_event(events).await {
        ServerEvent::Validated(connection) => connection,
        other => panic!("expected Validated, got {other:?}"),
    }
}

/// Hand a fresh in-memory connection to `tx` and negotiate the client end
async fn join(
    tx: &mpsc::Sender<Connection>,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<Connection> {
    let (server_end, client_end) = memory::default_pair();
    tx.send(server_end).await.unwrap();
    tokio::time::timeout(
        WAIT,
        validate_connection(client_end, Position::Challenger, validators),
    )
    .await
    .expect("client negotiation should finish")
}

fn channel_server(validators: Vec<Arc<dyn Validator>>) -> (Server, mpsc::Sender<Connection>) {
    let server = Server::new(validators);
    let (tx, source) = ChannelSource::new(16);
    server.add_source(source);
    (server, tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_client_is_validated() {
    let server = Server::new(names(&["tcp"]));
    let mut events = server.subscribe();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();
    assert_ne!(addr.port(), 0);

    let stream = TcpStream::connect(addr).await.unwrap();
    let client = Connection::from_tcp(stream, &TransportConfig::default());
    let client = tokio::time::timeout(
        WAIT,
        validate_connection(client, Position::Challenger, names(&["tcp"])),
    )
    .await
    .unwrap()
    .unwrap();

    let accepted = expect_validated(&mut events).await;
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.negotiating_count(), 0);
    assert_eq!(server.connections(), vec![accepted.clone()]);
    assert_eq!(accepted.peer_addr(), client.local_addr());

    server.shutdown().await.unwrap();
    tokio::time::timeout(WAIT, client.closed())
        .await
        .expect("client should see the server close");
}

#[tokio::test]
async fn test_channel_source_clients() {
    let (server, tx) = channel_server(names(&["a", "b"]));
    let mut events = server.subscribe();

    let first = join(&tx, names(&["a", "b"])).await.unwrap();
    let second = join(&tx, names(&["a", "b"])).await.unwrap();
    expect_validated(&mut events).await;
    expect_validated(&mut events).await;
    assert_eq!(server.connection_count(), 2);
    assert!(!first.is_closed() && !second.is_closed());
}

#[tokio::test]
async fn test_validation_failure_is_reported() {
    let (server, tx) = channel_server(names(&["right"]));
    let mut events = server.subscribe();

    let result = join(&tx, names(&["wrong"])).await;
    assert_eq!(
        result.unwrap_err().validation_failure(),
        Some(ValidationFailure::InvalidChallenge)
    );

    match next_event(&mut events).await {
        ServerEvent::ValidationFailed {
            connection,
            failure,
        } => {
            assert_eq!(failure, ValidationFailure::InvalidChallenge);
            assert!(connection.is_closed());
        }
        other => panic!("expected ValidationFailed, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.negotiating_count(), 0);
}

#[tokio::test]
async fn test_message_handler_sees_client_traffic() {
    let (server, tx) = channel_server(Vec::new());
    let mut events = server.subscribe();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |message: Bytes, _: &Connection| {
        let _ = seen_tx.send(message);
    });
    server.set_message_handler(Some(handler));

    let client = join(&tx, Vec::new()).await.unwrap();
    expect_validated(&mut events).await;
    client.write_message(Bytes::from_static(b"hi server")).unwrap();

    let message = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.as_ref(), b"hi server");
}

#[tokio::test]
async fn test_messages_buffer_until_handler_set() {
    let (server, tx) = channel_server(Vec::new());
    let mut events = server.subscribe();

    let client = join(&tx, Vec::new()).await.unwrap();
    let accepted = expect_validated(&mut events).await;
    client.write_message(Bytes::from_static(b"early")).unwrap();

    tokio::time::timeout(WAIT, async {
        while accepted.pending_messages() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message should be buffered");

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.set_message_handler(Some(Arc::new(move |message: Bytes, _: &Connection| {
        let _ = seen_tx.send(message);
    })));
    let message = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.as_ref(), b"early");
}

#[tokio::test]
async fn test_disconnect_client() {
    let (server, tx) = channel_server(Vec::new());
    let mut events = server.subscribe();

    let client = join(&tx, Vec::new()).await.unwrap();
    let accepted = expect_validated(&mut events).await;
    server.disconnect_client(&accepted).unwrap();

    match next_event(&mut events).await {
        ServerEvent::Disconnected { connection, reason } => {
            assert_eq!(connection, accepted);
            assert_eq!(reason, DisconnectReason::LocalClose);
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);
    tokio::time::timeout(WAIT, client.closed()).await.unwrap();

    assert!(matches!(
        server.disconnect_client(&accepted),
        Err(ProtocolError::InvalidState(_))
    ));
    let (stranger, _) = memory::default_pair();
    assert!(matches!(
        server.disconnect_client(&stranger),
        Err(ProtocolError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_client_leaving_is_reported() {
    let (server, tx) = channel_server(Vec::new());
    let mut events = server.subscribe();

    let client = join(&tx, Vec::new()).await.unwrap();
    expect_validated(&mut events).await;
    client.close();

    match next_event(&mut events).await {
        ServerEvent::Disconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::PeerClosed);
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_closed_server_rejects_connections() {
    let (server, tx) = channel_server(Vec::new());
    let mut events = server.subscribe();
    let client = join(&tx, Vec::new()).await.unwrap();
    let accepted = expect_validated(&mut events).await;

    server.close();
    assert!(server.is_closed());
    tokio::time::timeout(WAIT, accepted.closed()).await.unwrap();
    tokio::time::timeout(WAIT, client.closed()).await.unwrap();

    let (late, _peer) = memory::default_pair();
    assert!(matches!(
        server.accept(late.clone()),
        Err(ProtocolError::ServerClosed)
    ));
    assert!(late.is_closed());
    assert!(matches!(
        server.listen_tcp("127.0.0.1:0").await,
        Err(ProtocolError::ServerClosed)
    ));

    // Closing twice is harmless
    server.close();
}

#[tokio::test]
async fn test_close_aborts_running_negotiations() {
    let server = Server::new(names(&["slow"]));
    let mut events = server.subscribe();

    // The client end never answers
    let (server_end, _silent) = memory::default_pair();
    server.accept(server_end.clone()).unwrap();
    assert_eq!(server.negotiating_count(), 1);

    server.close();
    assert_eq!(server.negotiating_count(), 0);
    tokio::time::timeout(WAIT, server_end.closed()).await.unwrap();

    match next_event(&mut events).await {
        ServerEvent::ValidationFailed { failure, .. } => {
            assert_eq!(failure, ValidationFailure::Disconnect);
        }
        other => panic!("expected ValidationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_limit() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.max_connections = 1;
    });
    let server = Server::with_config(names(&["x"]), config);

    let (first, _first_peer) = memory::default_pair();
    server.accept(first).unwrap();

    let (second, _second_peer) = memory::default_pair();
    assert!(matches!(
        server.accept(second.clone()),
        Err(ProtocolError::ConnectionLimit(1))
    ));
    assert!(second.is_closed());
    assert_eq!(server.negotiating_count(), 1);
}

#[tokio::test]
async fn test_negotiation_timeout() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.negotiation_timeout = Some(Duration::from_millis(100));
    });
    let server = Server::with_config(names(&["x"]), config);
    let mut events = server.subscribe();

    let (server_end, silent) = memory::default_pair();
    let (abort_tx, mut abort_rx) = mpsc::unbounded_channel();
    silent.set_handler(move |message: Bytes, _: &Connection| {
        let _ = abort_tx.send(message);
    });
    server.accept(server_end).unwrap();

    match next_event(&mut events).await {
        ServerEvent::ValidationFailed { failure, .. } => {
            assert_eq!(failure, ValidationFailure::Timeout);
        }
        other => panic!("expected ValidationFailed, got {other:?}"),
    }

    // The challenge arrives first, then the abort
    let mut last = Bytes::new();
    while let Ok(Some(message)) = tokio::time::timeout(WAIT, abort_rx.recv()).await {
        last = message;
        if last.first() == Some(&0) {
            break;
        }
    }
    assert_eq!(last.as_ref(), &[0, ValidationFailure::Timeout.as_byte()]);
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Notice {
    text: String,
}
wire_message!(Notice { text: String });

#[derive(Debug, Default, Clone, PartialEq)]
struct Join {
    name: String,
}
wire_message!(Join { name: String });

fn chat_protocol(notices: mpsc::UnboundedSender<String>) -> Arc<ProtocolDefinition> {
    let protocol = ProtocolDefinition::builder(Arc::new(Registry::new()))
        .message::<Notice>()
        .handler(move |notice: Notice, _: &MessageContext<'_>| {
            let _ = notices.send(notice.text);
            Ok(())
        })
        .message::<Join>()
        .handler_with_answer(|join: Join, _: &MessageContext<'_>| {
            Ok(Notice {
                text: format!("welcome {}", join.name),
            })
        })
        .build()
        .unwrap();
    Arc::new(protocol)
}

async fn join_protocol(
    tx: &mpsc::Sender<Connection>,
    protocol: Arc<ProtocolDefinition>,
) -> ProtocolConnection {
    let (server_end, client_end) = memory::default_pair();
    tx.send(server_end).await.unwrap();
    tokio::time::timeout(
        WAIT,
        ProtocolConnection::create_with_validation(
            client_end,
            protocol,
            Position::Challenger,
            names(&["chat"]),
        ),
    )
    .await
    .unwrap()
    .unwrap()
}

async fn recv_text(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn test_protocol_server_dispatch_and_broadcast() {
    let (server_notices, _server_rx) = mpsc::unbounded_channel();
    let server = ProtocolServer::new(chat_protocol(server_notices), names(&["chat"]));
    let mut events = server.subscribe();
    let (tx, source) = ChannelSource::new(4);
    server.add_source(source);

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let a = join_protocol(&tx, chat_protocol(a_tx)).await;
    let _b = join_protocol(&tx, chat_protocol(b_tx)).await;
    expect_validated(&mut events).await;
    expect_validated(&mut events).await;
    assert_eq!(server.connections().len(), 2);

    // Requests are dispatched on the server and answered to the sender only
    a.write_message(&Join { name: "ada".into() }).unwrap();
    assert_eq!(recv_text(&mut a_rx).await, "welcome ada");

    let sent = server
        .broadcast(&Notice {
            text: "hello all".into(),
        })
        .unwrap();
    assert_eq!(sent, 2);
    assert_eq!(recv_text(&mut a_rx).await, "hello all");
    assert_eq!(recv_text(&mut b_rx).await, "hello all");
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_protocol_server_rejects_other_protocols() {
    let (notices, _rx) = mpsc::unbounded_channel();
    let server = ProtocolServer::new(chat_protocol(notices), names(&["chat"]));
    let mut events = server.subscribe();
    let (tx, source) = ChannelSource::new(4);
    server.add_source(source);

    let other = ProtocolDefinition::builder(Arc::new(Registry::new()))
        .message::<Notice>()
        .handler(|_: Notice, _: &MessageContext<'_>| Ok(()))
        .build()
        .unwrap();

    let (server_end, client_end) = memory::default_pair();
    tx.send(server_end).await.unwrap();
    let result = ProtocolConnection::create_with_validation(
        client_end,
        Arc::new(other),
        Position::Challenger,
        names(&["chat"]),
    )
    .await;
    assert_eq!(
        result.unwrap_err().validation_failure(),
        Some(ValidationFailure::InvalidChallenge)
    );
    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::ValidationFailed { .. }
    ));
}

#[tokio::test]
async fn test_protocol_server_disconnect_and_shutdown() {
    let (notices, _rx) = mpsc::unbounded_channel();
    let server = ProtocolServer::new(chat_protocol(notices), names(&["chat"]));
    let mut events = server.subscribe();
    let (tx, source) = ChannelSource::new(4);
    server.add_source(source);

    let (client_tx, _client_rx) = mpsc::unbounded_channel();
    let client = join_protocol(&tx, chat_protocol(client_tx.clone())).await;
    let other = join_protocol(&tx, chat_protocol(client_tx)).await;
    expect_validated(&mut events).await;
    expect_validated(&mut events).await;

    let first = server.connections().remove(0);
    server.disconnect_client(&first).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::Disconnected { .. }
    ));
    assert_eq!(server.connections().len(), 1);

    server.shutdown().await.unwrap();
    tokio::time::timeout(WAIT, client.connection().closed()).await.unwrap();
    tokio::time::timeout(WAIT, other.connection().closed()).await.unwrap();
    assert!(server.server().is_closed());
}
