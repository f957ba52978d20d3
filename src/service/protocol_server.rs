use crate::config::NetworkConfig;
use crate::error::Result;
use crate::negotiation::Validator;
use crate::protocol::connection::dispatch_handler;
use crate::protocol::{Message, ProtocolConnection, ProtocolDefinition};
use crate::service::server::{Server, ServerEvent};
use crate::service::source::ConnectionSource;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::ToSocketAddrs;
use tokio::sync::broadcast;
use tracing::debug;

/// A [`Server`] whose clients speak one [`ProtocolDefinition`].
///
/// Clients must pass the extra validators given at construction followed by
/// the protocol fingerprint check. Validated clients have their messages
/// dispatched to the protocol's handlers.
#[derive(Clone)]
pub struct ProtocolServer {
    server: Server,
    protocol: Arc<ProtocolDefinition>,
}

impl ProtocolServer {
    pub fn new(protocol: Arc<ProtocolDefinition>, additional: Vec<Arc<dyn Validator>>) -> Self {
        Self::with_config(protocol, additional, NetworkConfig::default())
    }

    pub fn with_config(
        protocol: Arc<ProtocolDefinition>,
        additional: Vec<Arc<dyn Validator>>,
        config: NetworkConfig,
    ) -> Self {
        let mut validators = additional;
        validators.push(protocol.validator());
        let server = Server::with_config(validators, config);
        server.set_message_handler(Some(dispatch_handler(protocol.clone())));
        debug!(messages = protocol.len(), "Protocol server created");
        Self { server, protocol }
    }

    /// The underlying connection server
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn protocol(&self) -> &Arc<ProtocolDefinition> {
        &self.protocol
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.server.subscribe()
    }

    pub fn add_source<S: ConnectionSource>(&self, source: S) {
        self.server.add_source(source);
    }

    pub async fn listen_tcp<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr> {
        self.server.listen_tcp(addr).await
    }

    /// Validated clients
    pub fn connections(&self) -> Vec<ProtocolConnection> {
        self.server
            .connections()
            .into_iter()
            .map(|connection| ProtocolConnection::wrap(connection, self.protocol.clone()))
            .collect()
    }

    /// Send `message` to every validated client; returns how many accepted it
    pub fn broadcast<T: Message>(&self, message: &T) -> Result<usize> {
        let bytes = self.protocol.encode(message)?;
        let sent = self
            .server
            .connections()
            .iter()
            .filter(|connection| connection.write_message(bytes.clone()).is_ok())
            .count();
        Ok(sent)
    }

    pub fn disconnect_client(&self, client: &ProtocolConnection) -> Result<()> {
        self.server.disconnect_client(client.connection())
    }

    pub fn close(&self) {
        self.server.close();
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.server.shutdown().await
    }
}
