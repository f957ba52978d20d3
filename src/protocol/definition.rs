use crate::error::{ProtocolError, Result};
use crate::negotiation::Validator;
use crate::protocol::dispatcher::MessageContext;
use crate::protocol::validator::ProtocolValidator;
use crate::serialization::{
    Composite, CompositeBlueprint, Registry, TypeEntry, TypeFingerprint, TypeInfo,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One id byte on the wire, one id reserved: at most 255 message types
pub const MAX_MESSAGE_TYPES: usize = 255;

/// Marks a composite as a top-level protocol message
pub trait Message: Composite {}

/// What happens when a message handler returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerErrorPolicy {
    /// Log the error and keep the connection
    #[default]
    Log,
    /// Log the error and close the connection
    Disconnect,
}

pub(crate) type ErasedHandler =
    Arc<dyn Fn(Box<dyn Any + Send>, &MessageContext<'_>) -> Result<()> + Send + Sync>;

/// A message type as assigned by a built [`ProtocolDefinition`]
pub struct MessageDefinition {
    id: u8,
    type_id: TypeId,
    type_name: &'static str,
    entry: Arc<TypeEntry>,
    answer_type: Option<&'static str>,
    error_policy: HandlerErrorPolicy,
    pub(crate) handler: ErasedHandler,
}

impl MessageDefinition {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Identity of the registered entry, member count included
    pub fn info(&self) -> &TypeInfo {
        self.entry.info()
    }

    pub fn fingerprint(&self) -> TypeFingerprint {
        self.entry.fingerprint()
    }

    pub fn entry(&self) -> &Arc<TypeEntry> {
        &self.entry
    }

    /// Message type sent back by the handler, if it answers
    pub fn answer_type(&self) -> Option<&'static str> {
        self.answer_type
    }

    pub fn error_policy(&self) -> HandlerErrorPolicy {
        self.error_policy
    }
}

impl fmt::Debug for MessageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDefinition")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("fingerprint", &self.fingerprint())
            .field("answer_type", &self.answer_type)
            .field("error_policy", &self.error_policy)
            .finish()
    }
}

/// Message types, ids and handlers of one application protocol.
///
/// Ids are the rank of each message type when sorted by (name, namespace),
/// so two peers that declare the same set of types agree on every id
/// regardless of declaration order. The protocol fingerprint
/// (`[id][type fingerprint LE]` per message, in id order) is checked during
/// negotiation by [`ProtocolValidator`].
pub struct ProtocolDefinition {
    registry: Arc<Registry>,
    messages: Vec<MessageDefinition>,
    ids: HashMap<TypeId, u8>,
    fingerprint: Bytes,
}

impl ProtocolDefinition {
    pub fn builder(registry: Arc<Registry>) -> ProtocolBuilder {
        ProtocolBuilder {
            registry,
            messages: Vec::new(),
            composites: Vec::new(),
            handlers: Vec::new(),
            policies: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Definitions in id order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn id_of<T: Message>(&self) -> Option<u8> {
        self.ids.get(&TypeId::of::<T>()).copied()
    }

    pub fn definition(&self, id: u8) -> Option<&MessageDefinition> {
        self.messages.get(usize::from(id))
    }

    pub fn fingerprint(&self) -> &Bytes {
        &self.fingerprint
    }

    /// Negotiation validator proving the peer uses the same message set
    pub fn validator(&self) -> Arc<dyn Validator> {
        Arc::new(ProtocolValidator::new(self.fingerprint.clone()))
    }

    /// Encode `message` as `[id][payload]`
    pub fn encode<T: Message>(&self, message: &T) -> Result<Bytes> {
        let id = self.id_of::<T>().ok_or_else(|| {
            ProtocolError::UnknownMessageType(std::any::type_name::<T>().to_string())
        })?;
        let mut out = vec![id];
        self.messages[usize::from(id)]
            .entry
            .encode_value(message, &mut out)?;
        Ok(Bytes::from(out))
    }
}

impl fmt::Debug for ProtocolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDefinition")
            .field("messages", &self.messages)
            .finish()
    }
}

struct DeclaredMessage {
    type_id: TypeId,
    type_name: &'static str,
    info: TypeInfo,
    blueprint: CompositeBlueprint,
}

struct DeclaredHandler {
    type_id: TypeId,
    type_name: &'static str,
    answer: Option<(TypeId, &'static str)>,
    handler: ErasedHandler,
}

/// Collects message types, supporting composites and handlers, then
/// validates and freezes them into a [`ProtocolDefinition`].
pub struct ProtocolBuilder {
    registry: Arc<Registry>,
    messages: Vec<DeclaredMessage>,
    composites: Vec<CompositeBlueprint>,
    handlers: Vec<DeclaredHandler>,
    policies: HashMap<TypeId, HandlerErrorPolicy>,
}

impl ProtocolBuilder {
    /// Declare a message type; declaring it twice has no effect
    pub fn message<T: Message>(mut self) -> Self {
        let type_id = TypeId::of::<T>();
        if !self.messages.iter().any(|m| m.type_id == type_id) {
            self.messages.push(DeclaredMessage {
                type_id,
                type_name: std::any::type_name::<T>(),
                info: T::type_info(),
                blueprint: CompositeBlueprint::of::<T>(),
            });
        }
        self
    }

    /// Declare a composite used inside messages that is not a message itself
    pub fn composite<T: Composite>(mut self) -> Self {
        self.composites.push(CompositeBlueprint::of::<T>());
        self
    }

    /// Handle messages of type `T`
    pub fn handler<T, F>(mut self, handler: F) -> Self
    where
        T: Message,
        F: Fn(T, &MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push(DeclaredHandler {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            answer: None,
            handler: Arc::new(move |value, context| handler(unbox::<T>(value)?, context)),
        });
        self
    }

    /// Handle messages of type `T` and send the returned `A` back to the sender
    pub fn handler_with_answer<T, A, F>(mut self, handler: F) -> Self
    where
        T: Message,
        A: Message,
        F: Fn(T, &MessageContext<'_>) -> Result<A> + Send + Sync + 'static,
    {
        self.handlers.push(DeclaredHandler {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            answer: Some((TypeId::of::<A>(), std::any::type_name::<A>())),
            handler: Arc::new(move |value, context| {
                let answer = handler(unbox::<T>(value)?, context)?;
                context.reply(&answer)
            }),
        });
        self
    }

    /// Set the handler error policy for `T` (default [`HandlerErrorPolicy::Log`])
    pub fn error_policy<T: Message>(mut self, policy: HandlerErrorPolicy) -> Self {
        self.policies.insert(TypeId::of::<T>(), policy);
        self
    }

    /// Validate handlers, register composites and assign ids.
    ///
    /// Fails on an empty or oversized message set, a message without a
    /// handler, a message with several handlers, a handler (or answer type)
    /// referencing an undeclared message, or a serialization error while
    /// registering the composites.
    pub fn build(self) -> Result<ProtocolDefinition> {
        let ProtocolBuilder {
            registry,
            messages,
            composites,
            handlers,
            policies,
        } = self;

        if messages.is_empty() {
            return Err(ProtocolError::EmptyProtocol);
        }
        if messages.len() > MAX_MESSAGE_TYPES {
            return Err(ProtocolError::TooManyMessageTypes(messages.len()));
        }

        let declared = |type_id: TypeId| messages.iter().any(|m| m.type_id == type_id);
        let mut paired: HashMap<TypeId, DeclaredHandler> = HashMap::new();
        for handler in handlers {
            if !declared(handler.type_id) {
                return Err(ProtocolError::OrphanHandler(handler.type_name.to_string()));
            }
            if let Some((answer_id, answer_name)) = handler.answer {
                if !declared(answer_id) {
                    return Err(ProtocolError::UnknownMessageType(answer_name.to_string()));
                }
            }
            if paired.contains_key(&handler.type_id) {
                return Err(ProtocolError::DuplicateHandler(handler.type_name.to_string()));
            }
            paired.insert(handler.type_id, handler);
        }
        if let Some(unhandled) = messages.iter().find(|m| !paired.contains_key(&m.type_id)) {
            return Err(ProtocolError::MissingHandler(unhandled.type_name.to_string()));
        }

        let mut blueprints = composites;
        let mut ordered = Vec::with_capacity(messages.len());
        for message in messages {
            let DeclaredMessage {
                type_id,
                type_name,
                info,
                blueprint,
            } = message;
            blueprints.push(blueprint);
            ordered.push((type_id, type_name, info));
        }
        registry.try_register_composites(blueprints)?;

        ordered.sort_by(|a, b| {
            (&a.2.name, &a.2.namespace, a.1).cmp(&(&b.2.name, &b.2.namespace, b.1))
        });

        let mut definitions = Vec::with_capacity(ordered.len());
        let mut ids = HashMap::with_capacity(ordered.len());
        let mut fingerprint = BytesMut::with_capacity(ordered.len() * 5);
        for (index, (type_id, type_name, _)) in ordered.into_iter().enumerate() {
            let id = u8::try_from(index)
                .map_err(|_| ProtocolError::TooManyMessageTypes(index + 1))?;
            let entry = registry
                .get_by_id(type_id)?
                .ok_or_else(|| ProtocolError::EntryNotFound(type_name.to_string()))?;
            let handler = paired
                .remove(&type_id)
                .ok_or_else(|| ProtocolError::MissingHandler(type_name.to_string()))?;

            fingerprint.put_u8(id);
            fingerprint.extend_from_slice(&entry.fingerprint().to_le_bytes());
            ids.insert(type_id, id);

            debug!(id, message = type_name, "Assigned message id");
            definitions.push(MessageDefinition {
                id,
                type_id,
                type_name,
                entry,
                answer_type: handler.answer.map(|(_, name)| name),
                error_policy: policies.get(&type_id).copied().unwrap_or_default(),
                handler: handler.handler,
            });
        }

        Ok(ProtocolDefinition {
            registry,
            messages: definitions,
            ids,
            fingerprint: fingerprint.freeze(),
        })
    }
}

fn unbox<T: 'static>(value: Box<dyn Any + Send>) -> Result<T> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| ProtocolError::TypeMismatch(std::any::type_name::<T>().to_string()))
}

/// Implement [`Message`] together with the composite codec of a struct.
///
/// Takes the same field list as [`wire_composite!`](crate::wire_composite).
#[macro_export]
macro_rules! wire_message {
    ($name:ty { $($field:ident : $ty:ty),* $(,)? }) => {
        $crate::wire_composite!($name { $($field : $ty),* });

        impl $crate::protocol::Message for $name {}
    };
}
