//! In-process connection pairs.
//!
//! Both ends speak the normal stream framing over a `tokio::io::duplex`
//! pipe, so everything above the socket behaves exactly as it does on TCP.

use crate::config::TransportConfig;
use crate::transport::connection::Connection;

/// Pipe capacity per direction
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Create two connected stream connections.
///
/// Must be called from within a Tokio runtime.
pub fn pair(config: &TransportConfig) -> (Connection, Connection) {
    let (left, right) = tokio::io::duplex(DUPLEX_CAPACITY);
    (
        Connection::from_stream(left, config),
        Connection::from_stream(right, config),
    )
}

/// [`pair`] with default transport settings
pub fn default_pair() -> (Connection, Connection) {
    pair(&TransportConfig::default())
}
