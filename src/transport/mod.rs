//! # Transport Layer
//!
//! [`Connection`] wraps one transport and turns it into a message channel.
//!
//! ## Transports
//! - **Stream** ([`stream`]): TCP or any `AsyncRead + AsyncWrite`, framed as
//!   `<u32 LE length><payload>`
//! - **Datagram** ([`datagram`]): UDP, one payload per datagram, bound to a
//!   single remote endpoint
//! - **Memory** ([`memory`]): in-process stream pairs
//!
//! ## Delivery
//! Every connection has one FIFO of received messages and at most one
//! installed [`MessageHandler`]. In [`DeliveryMode::Ordered`] the handler
//! sees messages in wire-arrival order, one at a time. With no handler
//! installed messages accumulate without bound.
//!
//! ## Disconnects
//! Read failure, peer shutdown and local `close()` all funnel into a single
//! shutdown path: writes are rejected from then on and disconnect listeners
//! fire exactly once with the cause.

pub mod connection;
pub mod datagram;
pub mod delivery;
pub mod memory;
pub mod stream;

pub use connection::{Connection, ConnectionId, DisconnectReason, SubscriptionId, TransportKind};
pub use delivery::{DeliveryMode, MessageHandler};
