use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result, ValidationFailure};
use crate::negotiation::{Negotiation, NegotiationResult, Position, Validator};
use crate::service::source::{ConnectionSource, TcpSource};
use crate::transport::{
    Connection, ConnectionId, DeliveryMode, DisconnectReason, MessageHandler,
};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::net::ToSocketAddrs;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle notifications published by a [`Server`]
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Negotiation succeeded; the connection is now a client
    Validated(Connection),
    /// Negotiation failed; the connection has been closed
    ValidationFailed {
        connection: Connection,
        failure: ValidationFailure,
    },
    /// A validated client went away
    Disconnected {
        connection: Connection,
        reason: DisconnectReason,
    },
}

struct PendingNegotiation {
    connection: Connection,
    handle: Option<Negotiation>,
}

#[derive(Default)]
struct ServerState {
    validated: HashMap<ConnectionId, Connection>,
    negotiating: HashMap<ConnectionId, PendingNegotiation>,
    handler: Option<Arc<dyn MessageHandler>>,
    closed: bool,
}

struct ServerInner {
    config: NetworkConfig,
    validators: Vec<Arc<dyn Validator>>,
    state: Mutex<ServerState>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

/// Accepts connections, negotiates as Authorizer, and tracks validated clients.
///
/// Connections come from any number of [`ConnectionSource`]s or are handed
/// in directly through [`accept`](Server::accept). Each is negotiated with
/// the server's validators; on success it joins the client set, gets the
/// server-wide message handler and the configured delivery mode. Cloning
/// yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self::with_config(validators, NetworkConfig::default())
    }

    pub fn with_config(validators: Vec<Arc<dyn Validator>>, config: NetworkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                config,
                validators,
                state: Mutex::new(ServerState::default()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Receive events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Run `source` until the server closes
    pub fn add_source<S: ConnectionSource>(&self, source: S) {
        let server = self.clone();
        let shutdown = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = Box::new(source).run(server, shutdown).await {
                warn!(error = %e, "Connection source stopped with error");
            }
        });
    }

    /// Listen for TCP clients on `addr`, returning the bound address
    #[instrument(skip(self, addr))]
    pub async fn listen_tcp<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr> {
        if self.is_closed() {
            return Err(ProtocolError::ServerClosed);
        }
        let source = TcpSource::bind(addr, self.inner.config.transport.clone()).await?;
        let local = source.local_addr()?;
        self.add_source(source);
        Ok(local)
    }

    /// Listen on the configured server address
    pub async fn listen(&self) -> Result<SocketAddr> {
        let address = self.inner.config.server.address.clone();
        self.listen_tcp(address).await
    }

    /// Start negotiating with a new connection.
    ///
    /// The connection is switched to ordered delivery for the handshake.
    /// Fails (closing the connection) once the server is closed or the
    /// connection limit is reached.
    pub fn accept(&self, connection: Connection) -> Result<()> {
        let id = connection.id();
        {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                connection.close();
                return Err(ProtocolError::ServerClosed);
            }
            let limit = self.inner.config.server.max_connections;
            if state.validated.len() + state.negotiating.len() >= limit {
                drop(state);
                warn!(connection = %id, limit, "Connection limit reached");
                connection.close();
                return Err(ProtocolError::ConnectionLimit(limit));
            }
            state.negotiating.insert(
                id,
                PendingNegotiation {
                    connection: connection.clone(),
                    handle: None,
                },
            );
        }

        debug!(connection = %id, peer = ?connection.peer_addr(), "Accepted connection");
        connection.set_delivery_mode(DeliveryMode::Ordered);

        let weak: Weak<ServerInner> = Arc::downgrade(&self.inner);
        let started = Negotiation::start(
            connection.clone(),
            Position::Authorizer,
            self.inner.validators.clone(),
            move |result| {
                if let Some(inner) = weak.upgrade() {
                    Server { inner }.on_negotiated(id, result);
                }
            },
        );

        let negotiation = match started {
            Ok(negotiation) => negotiation,
            Err(e) => {
                self.lock().negotiating.remove(&id);
                connection.close();
                return Err(e);
            }
        };

        // The session may already have finished and removed its entry
        if let Some(pending) = self.lock().negotiating.get_mut(&id) {
            pending.handle = Some(negotiation.clone());
        }

        if let Some(timeout) = self.inner.config.server.negotiation_timeout {
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        negotiation.abort_with(ValidationFailure::Timeout);
                    }
                    _ = connection.closed() => {}
                }
            });
        }
        Ok(())
    }

    fn on_negotiated(&self, id: ConnectionId, result: NegotiationResult) {
        match result {
            Ok(connection) => {
                {
                    let mut state = self.lock();
                    state.negotiating.remove(&id);
                    if state.closed {
                        drop(state);
                        connection.close();
                        return;
                    }
                    state.validated.insert(id, connection.clone());
                    connection.set_delivery_mode(self.inner.config.transport.delivery_mode);
                    connection.set_handler_arc(state.handler.clone());
                }

                info!(connection = %id, "Client validated");
                let _ = self
                    .inner
                    .events
                    .send(ServerEvent::Validated(connection.clone()));

                let weak = Arc::downgrade(&self.inner);
                connection.on_disconnect(move |connection, reason| {
                    if let Some(inner) = weak.upgrade() {
                        Server { inner }.on_disconnected(connection, reason);
                    }
                });
            }
            Err(failure) => {
                let pending = self.lock().negotiating.remove(&id);
                if let Some(pending) = pending {
                    let _ = self.inner.events.send(ServerEvent::ValidationFailed {
                        connection: pending.connection,
                        failure,
                    });
                }
            }
        }
    }

    fn on_disconnected(&self, connection: &Connection, reason: &DisconnectReason) {
        let removed = self.lock().validated.remove(&connection.id());
        if removed.is_some() {
            info!(connection = %connection.id(), %reason, "Client disconnected");
            let _ = self.inner.events.send(ServerEvent::Disconnected {
                connection: connection.clone(),
                reason: reason.clone(),
            });
        }
    }

    /// Install (or with `None`, remove) the handler of every client,
    /// current and future. Without a handler, client messages are buffered.
    pub fn set_message_handler(&self, handler: Option<Arc<dyn MessageHandler>>) {
        let mut state = self.lock();
        state.handler = handler;
        for connection in state.validated.values() {
            connection.set_handler_arc(state.handler.clone());
        }
    }

    /// Snapshot of the validated clients
    pub fn connections(&self) -> Vec<Connection> {
        self.lock().validated.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().validated.len()
    }

    /// Connections still negotiating
    pub fn negotiating_count(&self) -> usize {
        self.lock().negotiating.len()
    }

    /// Close one validated client
    pub fn disconnect_client(&self, connection: &Connection) -> Result<()> {
        let known = self.lock().validated.contains_key(&connection.id());
        if !known {
            return Err(ProtocolError::InvalidState(
                constants::ERR_NOT_A_CLIENT.to_string(),
            ));
        }
        connection.close();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stop all sources, abort running negotiations and close every client.
    ///
    /// Connections accepted afterwards are closed immediately.
    pub fn close(&self) {
        let (pending, clients) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Entries stay until each session reports back through on_negotiated
            let pending: Vec<(Connection, Option<Negotiation>)> = state
                .negotiating
                .values()
                .map(|p| (p.connection.clone(), p.handle.clone()))
                .collect();
            let clients: Vec<Connection> = state.validated.values().cloned().collect();
            (pending, clients)
        };

        info!(
            negotiating = pending.len(),
            clients = clients.len(),
            "Closing server"
        );
        self.inner.shutdown.cancel();

        for (connection, handle) in pending {
            match handle {
                Some(handle) => handle.abort(),
                None => connection.close(),
            }
        }
        for connection in clients {
            connection.close();
        }
    }

    /// [`close`](Server::close), then wait up to the configured shutdown
    /// timeout for every client transport to stop.
    pub async fn shutdown(&self) -> Result<()> {
        let clients = self.connections();
        self.close();

        let timeout = self.inner.config.server.shutdown_timeout;
        let waited = with_timeout_error(
            async {
                for connection in &clients {
                    connection.closed().await;
                }
                Ok(())
            },
            timeout,
        )
        .await;
        if waited.is_err() {
            warn!(timeout_ms = ?timeout.as_millis(), "Shutdown timeout reached, forcing exit");
        }
        global_metrics().log_metrics();
        waited
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Server")
            .field("validators", &self.inner.validators.len())
            .field("clients", &state.validated.len())
            .field("negotiating", &state.negotiating.len())
            .field("closed", &state.closed)
            .finish()
    }
}
