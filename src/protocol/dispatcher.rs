use crate::error::Result;
use crate::protocol::connection::ProtocolConnection;
use crate::protocol::definition::{HandlerErrorPolicy, Message, ProtocolDefinition};
use crate::utils::metrics::global_metrics;
use tracing::{debug, warn};

/// What a handler sees besides the message itself
pub struct MessageContext<'a> {
    connection: &'a ProtocolConnection,
    message_id: u8,
}

impl<'a> MessageContext<'a> {
    pub fn connection(&self) -> &'a ProtocolConnection {
        self.connection
    }

    /// Id of the message being handled
    pub fn message_id(&self) -> u8 {
        self.message_id
    }

    /// Send `message` back on the connection the current message came from
    pub fn reply<T: Message>(&self, message: &T) -> Result<()> {
        self.connection.write_message(message)
    }
}

impl ProtocolDefinition {
    /// Route one incoming `[id][payload]` message to its handler.
    ///
    /// Unknown ids and empty messages are dropped. Payloads that fail to
    /// decode are dropped and counted as protocol errors. Handler errors are
    /// logged and, under [`HandlerErrorPolicy::Disconnect`], close the
    /// connection.
    pub fn dispatch(&self, message: &[u8], connection: &ProtocolConnection) {
        let conn_id = connection.connection().id();
        let Some((&id, payload)) = message.split_first() else {
            debug!(connection = %conn_id, "Dropping empty message");
            global_metrics().unknown_message();
            return;
        };
        let Some(definition) = self.definition(id) else {
            debug!(connection = %conn_id, id, "Dropping message with unknown id");
            global_metrics().unknown_message();
            return;
        };

        let value = match definition.entry().decode_any(payload) {
            Ok(value) => value,
            Err(e) => {
                global_metrics().protocol_error();
                warn!(
                    connection = %conn_id,
                    message = definition.type_name(),
                    error = %e,
                    "Failed to decode message"
                );
                return;
            }
        };

        let context = MessageContext {
            connection,
            message_id: id,
        };
        if let Err(e) = (definition.handler)(value, &context) {
            global_metrics().handler_error();
            warn!(
                connection = %conn_id,
                message = definition.type_name(),
                error = %e,
                policy = ?definition.error_policy(),
                "Message handler failed"
            );
            if definition.error_policy() == HandlerErrorPolicy::Disconnect {
                connection.close();
            }
        }
    }
}
