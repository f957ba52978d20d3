//! # Core Framing
//!
//! Low-level framing for byte-stream transports.
//!
//! ## Wire Format
//! ```text
//! [Length(4, little-endian)] [Payload(N)]
//! ```
//!
//! Datagram transports do not use this codec: the datagram boundary is the
//! message boundary.
//!
//! ## Limits
//! - The announced length is checked against the configured maximum frame
//!   size before any buffer is reserved for the payload

pub mod codec;
