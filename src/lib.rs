//! # peerlink
//!
//! Peer-to-peer binary messaging: framed connections, a pre-traffic
//! negotiation handshake, a registry of per-type binary codecs, and typed
//! application protocols on top.
//!
//! ## Layers
//! ```text
//! ProtocolServer / ProtocolConnection   typed messages, [id][payload]
//! Server / Negotiation                  validator handshake, client set
//! Connection                            framing, delivery queue, disconnects
//! TCP / UDP / in-memory                 transports
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use peerlink::negotiation::{NameValidator, Position, Validator};
//! use peerlink::protocol::{ProtocolConnection, ProtocolDefinition};
//! use peerlink::serialization::Registry;
//! use peerlink::transport::Connection;
//! use peerlink::config::TransportConfig;
//! use peerlink::wire_message;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default)]
//! struct Chat {
//!     text: String,
//! }
//!
//! wire_message!(Chat { text: String });
//!
//! # async fn run() -> peerlink::Result<()> {
//! let protocol = Arc::new(
//!     ProtocolDefinition::builder(Arc::new(Registry::new()))
//!         .message::<Chat>()
//!         .handler(|chat: Chat, _ctx| {
//!             println!("{}", chat.text);
//!             Ok(())
//!         })
//!         .build()?,
//! );
//!
//! let config = TransportConfig::default();
//! let connection = Connection::connect_tcp("127.0.0.1:9000", &config).await?;
//! let code_word: Arc<dyn Validator> = Arc::new(NameValidator::new("lobby"));
//! let client = ProtocolConnection::create_with_validation(
//!     connection,
//!     protocol,
//!     Position::Challenger,
//!     vec![code_word],
//! )
//! .await?;
//! client.write_message(&Chat { text: "hello".into() })?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod negotiation;
pub mod protocol;
pub mod serialization;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result, ValidationFailure};
pub use negotiation::{NameValidator, Position, Validator};
pub use protocol::{Message, ProtocolConnection, ProtocolDefinition};
pub use serialization::Registry;
pub use service::{ProtocolServer, Server, ServerEvent};
pub use transport::{Connection, DeliveryMode, MessageHandler};
