use crate::error::Result;
use crate::negotiation::{self, Position, Validator};
use crate::protocol::definition::{Message, ProtocolDefinition};
use crate::transport::{Connection, MessageHandler};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A validated connection speaking one [`ProtocolDefinition`].
///
/// Incoming messages are routed to the definition's handlers; outgoing
/// messages are encoded as `[id][payload]`. Cloning shares the connection.
#[derive(Clone)]
pub struct ProtocolConnection {
    connection: Connection,
    protocol: Arc<ProtocolDefinition>,
}

impl ProtocolConnection {
    /// Negotiate on `connection` and attach `protocol` on success.
    ///
    /// The validators run are `additional` followed by the protocol's own
    /// fingerprint validator, so both peers must pass the same extra checks
    /// and share the same message set.
    #[instrument(skip_all, fields(connection = %connection.id(), ?position))]
    pub async fn create_with_validation(
        connection: Connection,
        protocol: Arc<ProtocolDefinition>,
        position: Position,
        additional: Vec<Arc<dyn Validator>>,
    ) -> Result<Self> {
        let mut validators = additional;
        validators.push(protocol.validator());
        let connection = negotiation::validate_connection(connection, position, validators).await?;
        Ok(Self::attach(connection, protocol))
    }

    /// Start dispatching messages of an already validated connection.
    ///
    /// Replaces any handler installed on the connection. Messages buffered
    /// while no handler was installed are dispatched through the protocol.
    pub fn attach(connection: Connection, protocol: Arc<ProtocolDefinition>) -> Self {
        connection.set_handler_arc(Some(dispatch_handler(protocol.clone())));
        debug!(connection = %connection.id(), messages = protocol.len(), "Protocol attached");
        Self {
            connection,
            protocol,
        }
    }

    /// Wrap without installing a handler
    pub(crate) fn wrap(connection: Connection, protocol: Arc<ProtocolDefinition>) -> Self {
        Self {
            connection,
            protocol,
        }
    }

    /// Encode and send one message
    pub fn write_message<T: Message>(&self, message: &T) -> Result<()> {
        let bytes: Bytes = self.protocol.encode(message)?;
        self.connection.write_message(bytes)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn protocol(&self) -> &Arc<ProtocolDefinition> {
        &self.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

impl PartialEq for ProtocolConnection {
    fn eq(&self, other: &Self) -> bool {
        self.connection == other.connection
    }
}

impl Eq for ProtocolConnection {}

impl fmt::Debug for ProtocolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConnection")
            .field("connection", &self.connection.id())
            .field("messages", &self.protocol.len())
            .finish()
    }
}

/// Routes raw connection messages into `protocol`.
///
/// Holds only the definition; the connection is passed in on every call.
struct DispatchHandler {
    protocol: Arc<ProtocolDefinition>,
}

impl MessageHandler for DispatchHandler {
    fn handle(&self, message: Bytes, connection: &Connection) {
        let sender = ProtocolConnection::wrap(connection.clone(), self.protocol.clone());
        self.protocol.dispatch(&message, &sender);
    }
}

pub(crate) fn dispatch_handler(protocol: Arc<ProtocolDefinition>) -> Arc<dyn MessageHandler> {
    Arc::new(DispatchHandler { protocol })
}
