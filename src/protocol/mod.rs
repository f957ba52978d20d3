//! # Application Protocols
//!
//! Typed messages on top of validated connections.
//!
//! A [`ProtocolDefinition`] is built once at startup from the message types
//! and their handlers. Each message type gets a one-byte id, the rank of the
//! type in (name, namespace) order, so independently built definitions over
//! the same types agree without exchanging names.
//!
//! ## Wire Format
//! ```text
//! [Id(1)] [Payload(N)]
//! ```
//!
//! ## Compatibility
//! The protocol fingerprint concatenates `[id][type fingerprint]` for every
//! message in id order. [`ProtocolValidator`] checks it during negotiation,
//! so traffic only flows between peers with identical message sets.
//!
//! Incoming messages with an unknown id are dropped.

pub mod connection;
pub mod definition;
pub mod dispatcher;
pub mod validator;

pub use connection::ProtocolConnection;
pub use definition::{
    HandlerErrorPolicy, Message, MessageDefinition, ProtocolBuilder, ProtocolDefinition,
    MAX_MESSAGE_TYPES,
};
pub use dispatcher::MessageContext;
pub use validator::ProtocolValidator;
