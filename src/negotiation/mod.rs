//! # Connection Negotiation
//!
//! Before a connection is handed to the application, both peers prove they
//! run the same ordered list of [`Validator`]s.
//!
//! ## Flow
//! ```text
//! Authorizer                         Challenger
//!     Challenge(v1) ------------------->
//!     <------------------- Answer(v1)
//!     Challenge(v2) ------------------->
//!     <------------------- Answer(v2)
//!     Success ------------------------->
//!     <------------------------- Success
//! ```
//! With no validators the Authorizer opens with Success. Any unexpected
//! message, rejected challenge or answer, validator count mismatch, or
//! disconnect fails the session: the connection is closed and, where the
//! peer is still reachable, an Abort carrying the [`ValidationFailure`]
//! reason is sent first.
//!
//! There is no timeout unless one is requested through
//! [`validate_connection_timeout`].

pub mod message;
pub mod session;
pub mod validator;

pub use message::{NegotiationMessage, NegotiationTag};
pub use session::{Negotiation, NegotiationResult, Position};
pub use validator::{NameValidator, Validator};

use crate::error::{constants, ProtocolError, Result, ValidationFailure};
use crate::transport::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::instrument;

fn start_with_channel(
    connection: Connection,
    position: Position,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<(Negotiation, oneshot::Receiver<NegotiationResult>)> {
    let (tx, rx) = oneshot::channel();
    let negotiation = Negotiation::start(connection, position, validators, move |result| {
        let _ = tx.send(result);
    })?;
    Ok((negotiation, rx))
}

fn into_result(
    received: std::result::Result<NegotiationResult, oneshot::error::RecvError>,
) -> Result<Connection> {
    match received {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(failure)) => Err(ProtocolError::Negotiation(failure)),
        Err(_) => Err(ProtocolError::Custom(
            constants::ERR_NEGOTIATION_DROPPED.to_string(),
        )),
    }
}

/// Negotiate and wait for the outcome.
///
/// Returns the validated connection (with no handler installed) or
/// `ProtocolError::Negotiation` carrying the failure reason.
#[instrument(skip(connection, validators), fields(connection = %connection.id()))]
pub async fn validate_connection(
    connection: Connection,
    position: Position,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<Connection> {
    let (_negotiation, rx) = start_with_channel(connection, position, validators)?;
    into_result(rx.await)
}

/// [`validate_connection`] bounded by `timeout`.
///
/// On expiry the session is aborted, the peer receives an Abort with reason
/// `Timeout`, and the connection is closed.
#[instrument(skip(connection, validators), fields(connection = %connection.id()))]
pub async fn validate_connection_timeout(
    connection: Connection,
    position: Position,
    validators: Vec<Arc<dyn Validator>>,
    timeout: Duration,
) -> Result<Connection> {
    let (negotiation, mut rx) = start_with_channel(connection, position, validators)?;
    match tokio::time::timeout(timeout, &mut rx).await {
        Ok(received) => into_result(received),
        Err(_) => {
            negotiation.abort_with(ValidationFailure::Timeout);
            // The session may have completed just as the timer fired
            into_result(rx.await)
        }
    }
}

/// Blocking form of [`validate_connection`].
///
/// Must not be called from an async context; the connection's tasks need a
/// running Tokio runtime on another thread.
pub fn validate_connection_blocking(
    connection: Connection,
    position: Position,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<Connection> {
    let (_negotiation, rx) = start_with_channel(connection, position, validators)?;
    into_result(rx.blocking_recv())
}
