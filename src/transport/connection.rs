use crate::config::TransportConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::delivery::{run_consumer, DeliveryMode, DeliveryQueue, MessageHandler};
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of transport underneath a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Reliable ordered byte stream; messages are length-prefixed
    Stream,
    /// Best-effort datagrams; one message per datagram
    Datagram,
}

/// Why a connection stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally
    LocalClose,
    /// The peer shut the stream down cleanly
    PeerClosed,
    /// The read or write path failed
    Transport(String),
    /// The peer violated framing (e.g. announced an oversized frame)
    Protocol(String),
}

impl DisconnectReason {
    pub(crate) fn from_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::OversizedPacket(_) | ProtocolError::InvalidData(_) => {
                Self::Protocol(error.to_string())
            }
            _ => Self::Transport(error.to_string()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalClose => f.write_str("closed locally"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Transport(e) => write!(f, "transport failure: {e}"),
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
        }
    }
}

/// Handle returned by [`Connection::on_disconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type DisconnectListener = Box<dyn FnOnce(&Connection, &DisconnectReason) + Send>;

#[derive(Default)]
struct DisconnectState {
    reason: Option<DisconnectReason>,
    listeners: Vec<(SubscriptionId, DisconnectListener)>,
    next_subscription: u64,
}

/// Commands consumed by a transport's writer task
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    FrameTo(Bytes, SocketAddr),
    Shutdown,
}

pub(crate) struct Inner {
    id: ConnectionId,
    kind: TransportKind,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    max_payload: usize,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    delivery: Arc<DeliveryQueue>,
    disconnect: Mutex<DisconnectState>,
}

/// Message-oriented wrapper around one transport.
///
/// Cloning yields another handle to the same connection. Writes are queued
/// to a single writer task, so concurrent callers never interleave frames.
/// Incoming messages are queued until a handler is installed with
/// [`set_handler`](Connection::set_handler).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Everything a transport needs to finish wiring a new connection
pub(crate) struct Parts {
    pub connection: Connection,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Connection {
    pub(crate) fn new_parts(
        kind: TransportKind,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        config: &TransportConfig,
    ) -> Parts {
        let (outbound, rx) = mpsc::unbounded_channel();
        let max_payload = match kind {
            TransportKind::Stream => config.max_frame_size,
            TransportKind::Datagram => config.max_datagram_payload,
        };
        let connection = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                kind,
                local_addr,
                peer_addr,
                max_payload,
                closed: AtomicBool::new(false),
                outbound,
                cancel: CancellationToken::new(),
                delivery: Arc::new(DeliveryQueue::new(config.delivery_mode)),
                disconnect: Mutex::new(DisconnectState::default()),
            }),
        };

        global_metrics().connection_established();
        tokio::spawn(run_consumer(
            connection.downgrade(),
            connection.inner.delivery.clone(),
        ));

        Parts {
            connection,
            outbound: rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Largest payload accepted by [`write_message`](Connection::write_message)
    pub fn max_payload(&self) -> usize {
        self.inner.max_payload
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue one message for sending.
    ///
    /// Fails with `ConnectionClosed` once the connection is closed and with
    /// `OversizedPacket` when the payload exceeds the transport ceiling.
    pub fn write_message(&self, message: impl Into<Bytes>) -> Result<()> {
        let message = message.into();
        self.check_size(&message)?;
        self.enqueue(Outbound::Frame(message))
    }

    /// Send one datagram to an arbitrary endpoint.
    ///
    /// Only datagram connections support this; the reply, if any, is still
    /// filtered against the bound remote endpoint.
    pub fn send_to(&self, message: impl Into<Bytes>, target: SocketAddr) -> Result<()> {
        if self.inner.kind != TransportKind::Datagram {
            return Err(ProtocolError::InvalidState(
                constants::ERR_STREAM_SEND_TO.to_string(),
            ));
        }
        let message = message.into();
        self.check_size(&message)?;
        self.enqueue(Outbound::FrameTo(message, target))
    }

    fn check_size(&self, message: &Bytes) -> Result<()> {
        if message.len() > self.inner.max_payload {
            return Err(ProtocolError::OversizedPacket(message.len()));
        }
        Ok(())
    }

    /// Queue under the disconnect lock, so an accepted write always lands
    /// ahead of the writer's shutdown marker.
    fn enqueue(&self, command: Outbound) -> Result<()> {
        let state = self.disconnect_state();
        if state.reason.is_some() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.inner
            .outbound
            .send(command)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Install the consumer of incoming messages, returning the previous one.
    ///
    /// `None` pauses delivery; messages keep accumulating in the queue.
    pub fn set_handler_arc(
        &self,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.inner.delivery.set_handler(handler)
    }

    /// Install a handler. See [`set_handler_arc`](Connection::set_handler_arc).
    pub fn set_handler<H: MessageHandler>(&self, handler: H) -> Option<Arc<dyn MessageHandler>> {
        self.set_handler_arc(Some(Arc::new(handler)))
    }

    /// Install a handler that must observe the connection stopping.
    ///
    /// Returns false, leaving the queue untouched, if delivery has already
    /// ended.
    pub(crate) fn install_handler(&self, handler: Arc<dyn MessageHandler>) -> bool {
        self.inner.delivery.install(handler)
    }

    pub fn clear_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.set_handler_arc(None)
    }

    pub fn has_handler(&self) -> bool {
        self.inner.delivery.has_handler()
    }

    /// Switch delivery mode; applies to messages not yet dispatched
    pub fn set_delivery_mode(&self, mode: DeliveryMode) {
        self.inner.delivery.set_mode(mode);
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.inner.delivery.mode()
    }

    /// Number of received messages waiting for a handler
    pub fn pending_messages(&self) -> usize {
        self.inner.delivery.pending()
    }

    /// Register a callback fired once when the connection stops.
    ///
    /// If the connection has already stopped the callback runs immediately.
    pub fn on_disconnect<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnOnce(&Connection, &DisconnectReason) + Send + 'static,
    {
        let mut state = self.disconnect_state();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;

        match state.reason.clone() {
            Some(reason) => {
                drop(state);
                listener(self, &reason);
            }
            None => state.listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// Remove a disconnect callback; returns false if it already fired
    pub fn remove_disconnect_listener(&self, id: SubscriptionId) -> bool {
        let mut state = self.disconnect_state();
        let before = state.listeners.len();
        state.listeners.retain(|(sub, _)| *sub != id);
        state.listeners.len() != before
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_state().reason.clone()
    }

    /// Stop accepting writes, flush what is queued, and shut the transport down.
    pub fn close(&self) {
        self.shutdown(DisconnectReason::LocalClose);
    }

    /// Resolves once the connection has stopped
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Single exit path for every way a connection can stop.
    ///
    /// Only the first call has any effect; listeners fire exactly once.
    pub(crate) fn shutdown(&self, reason: DisconnectReason) {
        let listeners = {
            let mut state = self.disconnect_state();
            if state.reason.is_some() {
                return;
            }
            self.inner.closed.store(true, Ordering::Release);
            state.reason = Some(reason.clone());
            // Sent while still locked: no write can be queued behind it
            let _ = self.inner.outbound.send(Outbound::Shutdown);
            std::mem::take(&mut state.listeners)
        };

        self.inner.cancel.cancel();
        self.inner.delivery.close();

        let metrics = global_metrics();
        metrics.connection_closed();
        match &reason {
            DisconnectReason::Transport(_) | DisconnectReason::Protocol(_) => {
                metrics.connection_error();
                info!(connection = %self.id(), reason = %reason, "Connection lost");
            }
            _ => debug!(connection = %self.id(), reason = %reason, "Connection closed"),
        }

        for (_, listener) in listeners {
            listener(self, &reason);
        }
    }

    pub(crate) fn push_incoming(&self, message: Bytes) {
        global_metrics().message_received(message.len() as u64);
        self.inner.delivery.push(message);
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    fn disconnect_state(&self) -> MutexGuard<'_, DisconnectState> {
        self.inner
            .disconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Inner {
    /// The last handle went away without `close()`.
    ///
    /// Dropping the outbound sender lets the writer flush and shut the
    /// transport down, so the peer sees end of stream. Disconnect listeners
    /// are not called; there is no connection left to hand them.
    fn drop(&mut self) {
        if *self.closed.get_mut() {
            return;
        }
        *self.closed.get_mut() = true;
        self.cancel.cancel();
        self.delivery.close();
        global_metrics().connection_closed();
        debug!(connection = %self.id, "Connection dropped");
    }
}

/// Non-owning handle held by the transport and delivery tasks
#[derive(Clone)]
pub(crate) struct WeakConnection(std::sync::Weak<Inner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
