//! # Server
//!
//! Accepts connections from pluggable sources, negotiates each one as
//! Authorizer and keeps the set of validated clients.
//!
//! ## Components
//! - **Server**: client bookkeeping, lifecycle events, server-wide handler
//! - **Sources**: TCP accept loop and channel-fed connections
//! - **ProtocolServer**: a server whose clients speak one protocol
//!
//! ## Lifecycle
//! ```text
//! source -> accept -> negotiating -> Validated -> ... -> Disconnected
//!                          \-> ValidationFailed (connection closed)
//! ```

pub mod protocol_server;
pub mod server;
pub mod source;

pub use protocol_server::ProtocolServer;
pub use server::{Server, ServerEvent};
pub use source::{ChannelSource, ConnectionSource, TcpSource};
