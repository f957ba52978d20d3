//! # Error Types
//!
//! Error handling for every layer of the stack.
//!
//! ## Error Categories
//! - **Transport**: socket failures, oversized frames, writes after close
//! - **Negotiation**: a handshake that ended in a [`ValidationFailure`]
//! - **Serialization**: missing or cyclic type dependencies, size mismatches
//! - **Protocol build**: handler pairing problems, too many message types
//!
//! Build-time failures (registry and protocol construction) are meant to abort
//! startup. Negotiation failures are returned to the caller that asked for the
//! handshake. Unknown message ids in live traffic are dropped, not raised.
//!
//! ## Example Usage
//! ```rust
//! use peerlink::error::{ProtocolError, Result};
//! use peerlink::serialization::Registry;
//!
//! fn encode_count(registry: &Registry, count: u32) -> Result<Vec<u8>> {
//!     registry.serialize(&count)
//! }
//!
//! let registry = Registry::empty();
//! match encode_count(&registry, 7) {
//!     Err(ProtocolError::EntryNotFound(name)) => assert_eq!(name, "u32"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on type registry";
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on type registry";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_STREAM_SEND_TO: &str = "send_to is only available on datagram connections";
    pub const ERR_LENGTH_PREFIX: &str = "Payload does not fit a 4-byte length prefix";

    /// Negotiation errors
    pub const ERR_HANDLER_INSTALLED: &str =
        "A message handler is already installed; negotiation would lose handshake messages";
    pub const ERR_UNORDERED_NEGOTIATION: &str = "Negotiation requires ordered delivery";
    pub const ERR_NEGOTIATION_DROPPED: &str = "Negotiation ended without reporting a result";

    /// Server errors
    pub const ERR_NOT_A_CLIENT: &str = "Connection is not a validated client of this server";

    /// Serialization errors
    pub const ERR_INVALID_UTF8: &str = "String payload is not valid UTF-8";
}

/// Reason a negotiation failed.
///
/// The discriminant is the reason byte carried by an Abort message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValidationFailure {
    Unknown = 0,
    WrongAnswer = 1,
    InvalidChallenge = 2,
    TooManyValidators = 3,
    InsufficientValidators = 4,
    UnknownMessage = 5,
    InvalidOrder = 6,
    Disconnect = 7,
    Timeout = 8,
}

impl ValidationFailure {
    /// Wire representation used in Abort messages
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a reason byte; anything unrecognised maps to `Unknown`
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::WrongAnswer,
            2 => Self::InvalidChallenge,
            3 => Self::TooManyValidators,
            4 => Self::InsufficientValidators,
            5 => Self::UnknownMessage,
            6 => Self::InvalidOrder,
            7 => Self::Disconnect,
            8 => Self::Timeout,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "unknown failure",
            Self::WrongAnswer => "wrong answer",
            Self::InvalidChallenge => "invalid challenge",
            Self::TooManyValidators => "peer has more validators",
            Self::InsufficientValidators => "peer has fewer validators",
            Self::UnknownMessage => "unknown negotiation message",
            Self::InvalidOrder => "message out of order",
            Self::Disconnect => "disconnected during negotiation",
            Self::Timeout => "negotiation timed out",
        };
        f.write_str(text)
    }
}

// ProtocolError is the primary error type for all operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Negotiation failed: {0}")]
    Negotiation(ValidationFailure),

    #[error("No serialization entry for type {0}")]
    EntryNotFound(String),

    #[error("Composite {composite} depends on unregistered type {dependency}")]
    MissingDependency {
        composite: String,
        dependency: String,
    },

    #[error("Cyclic dependency between {0} and {1}")]
    CyclicDependency(String, String),

    #[error("Size mismatch for {type_name}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Type {0} is already registered")]
    DuplicateEntry(String),

    #[error("Invalid value {value} for enum {type_name}")]
    InvalidEnumValue { type_name: String, value: String },

    #[error("Value is not of type {0}")]
    TypeMismatch(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Message type {0} has no handler")]
    MissingHandler(String),

    #[error("Message type {0} has more than one handler")]
    DuplicateHandler(String),

    #[error("Handler references {0}, which is not a message type of this protocol")]
    OrphanHandler(String),

    #[error("Too many message types: {0} (maximum 255)")]
    TooManyMessageTypes(usize),

    #[error("Protocol defines no message types")]
    EmptyProtocol,

    #[error("Message type {0} is not part of this protocol")]
    UnknownMessageType(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Server is closed")]
    ServerClosed,

    #[error("Connection limit reached: {0}")]
    ConnectionLimit(usize),

    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Negotiation failure carried by this error, if any
    pub fn validation_failure(&self) -> Option<ValidationFailure> {
        match self {
            Self::Negotiation(failure) => Some(*failure),
            _ => None,
        }
    }
}

impl From<ValidationFailure> for ProtocolError {
    fn from(failure: ValidationFailure) -> Self {
        Self::Negotiation(failure)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_byte_roundtrip() {
        for byte in 0..=8u8 {
            assert_eq!(ValidationFailure::from_byte(byte).as_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_reason_byte() {
        assert_eq!(ValidationFailure::from_byte(200), ValidationFailure::Unknown);
    }

    #[test]
    fn test_validation_failure_accessor() {
        let err: ProtocolError = ValidationFailure::WrongAnswer.into();
        assert_eq!(err.validation_failure(), Some(ValidationFailure::WrongAnswer));
        assert_eq!(ProtocolError::ConnectionClosed.validation_failure(), None);
    }
}
