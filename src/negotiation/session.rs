use crate::error::{constants, ProtocolError, Result, ValidationFailure};
use crate::negotiation::message::{NegotiationMessage, NegotiationTag};
use crate::negotiation::validator::Validator;
use crate::transport::{Connection, DeliveryMode, MessageHandler};
use crate::utils::metrics::{global_metrics, Timer};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Which side of the handshake a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// Sends the challenges and checks the answers
    Authorizer,
    /// Answers the challenges
    Challenger,
}

/// Outcome delivered to the completion callback
pub type NegotiationResult = std::result::Result<Connection, ValidationFailure>;

type Completion = Box<dyn FnOnce(NegotiationResult) + Send>;

struct SessionState {
    validators: VecDeque<Arc<dyn Validator>>,
    expected: NegotiationTag,
    on_complete: Option<Completion>,
    finished: bool,
}

struct Session {
    connection: Connection,
    position: Position,
    state: Mutex<SessionState>,
}

/// What to do after a message has been processed under the state lock
enum Step {
    Reply(NegotiationMessage),
    Fail {
        failure: ValidationFailure,
        notify_peer: bool,
    },
    Succeed {
        echo: bool,
    },
}

/// A running handshake on one connection.
///
/// The session installs itself as the connection's message handler and is
/// driven entirely by the ordered delivery queue. On completion the handler
/// is removed again; on failure the connection is closed. The completion
/// callback runs exactly once.
#[derive(Clone)]
pub struct Negotiation {
    session: Arc<Session>,
}

impl Negotiation {
    /// Start negotiating on `connection`.
    ///
    /// The connection must be in ordered delivery mode with no handler
    /// installed. The Authorizer sends its first message immediately.
    pub fn start<F>(
        connection: Connection,
        position: Position,
        validators: Vec<Arc<dyn Validator>>,
        on_complete: F,
    ) -> Result<Negotiation>
    where
        F: FnOnce(NegotiationResult) + Send + 'static,
    {
        if connection.has_handler() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_HANDLER_INSTALLED.to_string(),
            ));
        }
        if connection.delivery_mode() != DeliveryMode::Ordered {
            return Err(ProtocolError::InvalidState(
                constants::ERR_UNORDERED_NEGOTIATION.to_string(),
            ));
        }

        let validators: VecDeque<_> = validators.into();
        let expected = match (position, validators.is_empty()) {
            (_, true) => NegotiationTag::Success,
            (Position::Authorizer, false) => NegotiationTag::Answer,
            (Position::Challenger, false) => NegotiationTag::Challenge,
        };
        let opening = match position {
            Position::Authorizer => Some(match validators.front() {
                Some(first) => NegotiationMessage::Challenge(first.challenge()),
                None => NegotiationMessage::Success,
            }),
            Position::Challenger => None,
        };

        let session = Arc::new(Session {
            connection: connection.clone(),
            position,
            state: Mutex::new(SessionState {
                validators,
                expected,
                on_complete: Some(Box::new(on_complete)),
                finished: false,
            }),
        });

        global_metrics().negotiation_started();
        debug!(connection = %connection.id(), ?position, "Negotiation started");

        let handler = SessionHandler {
            session: session.clone(),
            _timer: Timer::start("negotiation"),
        };
        if !connection.install_handler(Arc::new(handler)) {
            // Delivery already ended; no message or close notice will arrive
            session.fail(ValidationFailure::Disconnect, false);
            return Ok(Negotiation { session });
        }

        if let Some(message) = opening {
            session.send(message);
        }

        Ok(Negotiation { session })
    }

    pub fn connection(&self) -> &Connection {
        &self.session.connection
    }

    pub fn position(&self) -> Position {
        self.session.position
    }

    pub fn is_finished(&self) -> bool {
        self.session.lock().finished
    }

    /// Abort with `Disconnect`, telling the peer why and closing the connection
    pub fn abort(&self) {
        self.abort_with(ValidationFailure::Disconnect);
    }

    pub fn abort_with(&self, failure: ValidationFailure) {
        self.session.fail(failure, true);
    }
}

impl fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiation")
            .field("connection", &self.session.connection.id())
            .field("position", &self.session.position)
            .finish()
    }
}

struct SessionHandler {
    session: Arc<Session>,
    _timer: Timer,
}

impl MessageHandler for SessionHandler {
    fn handle(&self, message: Bytes, _connection: &Connection) {
        self.session.on_message(&message);
    }

    fn on_closed(&self, _connection: &Connection) {
        self.session.fail(ValidationFailure::Disconnect, false);
    }
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_message(&self, message: &Bytes) {
        let step = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            self.advance(&mut state, message)
        };

        match step {
            Step::Reply(reply) => self.send(reply),
            Step::Fail {
                failure,
                notify_peer,
            } => self.fail(failure, notify_peer),
            Step::Succeed { echo } => self.succeed(echo),
        }
    }

    fn advance(&self, state: &mut SessionState, message: &Bytes) -> Step {
        let fail = |failure| Step::Fail {
            failure,
            notify_peer: true,
        };

        match NegotiationMessage::decode(message) {
            None => fail(ValidationFailure::UnknownMessage),

            Some(NegotiationMessage::Abort(reason)) => Step::Fail {
                failure: reason,
                notify_peer: false,
            },

            Some(NegotiationMessage::Challenge(challenge)) => {
                let Some(validator) = state.validators.pop_front() else {
                    return fail(ValidationFailure::TooManyValidators);
                };
                if state.expected != NegotiationTag::Challenge {
                    return fail(ValidationFailure::InvalidOrder);
                }
                if !validator.validate_challenge(&challenge) {
                    return fail(ValidationFailure::InvalidChallenge);
                }
                state.expected = if state.validators.is_empty() {
                    NegotiationTag::Success
                } else {
                    NegotiationTag::Challenge
                };
                Step::Reply(NegotiationMessage::Answer(validator.answer()))
            }

            Some(NegotiationMessage::Answer(answer)) => {
                if state.expected != NegotiationTag::Answer {
                    return fail(ValidationFailure::InvalidOrder);
                }
                let Some(validator) = state.validators.pop_front() else {
                    return fail(ValidationFailure::InvalidOrder);
                };
                if !validator.validate_answer(&answer) {
                    return fail(ValidationFailure::WrongAnswer);
                }
                match state.validators.front() {
                    Some(next) => Step::Reply(NegotiationMessage::Challenge(next.challenge())),
                    None => {
                        state.expected = NegotiationTag::Success;
                        Step::Reply(NegotiationMessage::Success)
                    }
                }
            }

            Some(NegotiationMessage::Success) => {
                if state.expected != NegotiationTag::Success || !state.validators.is_empty() {
                    return fail(ValidationFailure::InsufficientValidators);
                }
                Step::Succeed {
                    echo: self.position == Position::Challenger,
                }
            }
        }
    }

    fn send(&self, message: NegotiationMessage) {
        if let Err(e) = self.connection.write_message(message.encode()) {
            // The disconnect listener reports the failure
            debug!(connection = %self.connection.id(), error = %e, "Negotiation write failed");
        }
    }

    /// Take the completion callback, marking the session finished
    fn finish(&self) -> Option<Completion> {
        let callback = {
            let mut state = self.lock();
            if state.finished {
                return None;
            }
            state.finished = true;
            state.on_complete.take()
        };
        self.connection.clear_handler();
        callback
    }

    fn succeed(&self, echo: bool) {
        if echo {
            self.send(NegotiationMessage::Success);
        }
        let Some(callback) = self.finish() else {
            return;
        };

        global_metrics().negotiation_success();
        info!(connection = %self.connection.id(), position = ?self.position, "Connection validated");
        callback(Ok(self.connection.clone()));
    }

    fn fail(&self, failure: ValidationFailure, notify_peer: bool) {
        let Some(callback) = self.finish() else {
            return;
        };

        if notify_peer {
            self.send(NegotiationMessage::Abort(failure));
        }
        global_metrics().negotiation_failed();
        warn!(
            connection = %self.connection.id(),
            position = ?self.position,
            %failure,
            "Negotiation failed"
        );
        callback(Err(failure));
        self.connection.close();
    }
}
