//! Pre-application handshake.
//!
//! The engine only relies on the [`Handshaker`] state machine contract.
//! [`PlainHandshaker`] is a placeholder single round-trip exchange: the
//! initiator sends a greeting carrying the protocol version and the responder
//! answers with an acknowledgment. A key-agreement handshaker can be dropped
//! in behind the same trait.

use crate::error::HandshakeError;
use peerwire_common::frame::Message;
use peerwire_common::types::{code, PROTOCOL_VERSION};
use std::sync::Arc;
use tracing::trace;

/// Progress of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Neither role has been chosen yet.
    Uninitialized,
    /// Initiator chosen, first message not produced yet.
    Prepared,
    /// Waiting for the peer's next message.
    InProgress,
    /// Both sides agree; post-handshake traffic may start.
    Success,
    /// A protocol violation ended the handshake.
    Failed,
}

impl HandshakeStatus {
    /// Label used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Prepared => "prepared",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Which end of the connection started the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out; speaks first.
    Initiator,
    /// Accepted the connection; waits for the greeting.
    Responder,
}

/// Handshake state machine driven by the connection task.
///
/// One instance per connection, never reused.
pub trait Handshaker: Send {
    /// `Uninitialized -> Prepared`.
    ///
    /// # Errors
    ///
    /// Fails if the handshake was already prepared.
    fn prepare_initiator(&mut self) -> Result<(), HandshakeError>;

    /// `Uninitialized -> InProgress`.
    ///
    /// # Errors
    ///
    /// Fails if the handshake was already prepared.
    fn prepare_responder(&mut self) -> Result<(), HandshakeError>;

    /// Current status.
    fn status(&self) -> HandshakeStatus;

    /// Produces the initiator's opening message, `Prepared -> InProgress`.
    ///
    /// # Errors
    ///
    /// Fails when called by a responder or more than once.
    fn first_message(&mut self) -> Result<Message, HandshakeError>;

    /// Consumes a peer message and optionally returns a reply to send.
    ///
    /// # Errors
    ///
    /// Any out-of-order or unexpected message moves the handshake to
    /// [`HandshakeStatus::Failed`] and returns an error.
    fn handle_message(&mut self, msg: &Message) -> Result<Option<Message>, HandshakeError>;
}

/// Builds a fresh handshaker for every connection.
pub type HandshakerFactory = Arc<dyn Fn() -> Box<dyn Handshaker> + Send + Sync>;

/// Factory for [`PlainHandshaker`].
#[must_use]
pub fn plain_handshaker_factory() -> HandshakerFactory {
    Arc::new(|| Box::new(PlainHandshaker::new()))
}

/// Code of the initiator's greeting.
const GREETING: u32 = code::PING;
/// Code of the responder's acknowledgment.
const ACK: u32 = code::PONG;

/// Placeholder greeting/acknowledgment handshake without cryptography.
#[derive(Debug)]
pub struct PlainHandshaker {
    status: HandshakeStatus,
    role: Option<Role>,
    greeting_seen: bool,
    ack_seen: bool,
}

impl PlainHandshaker {
    /// Creates an uninitialized handshaker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: HandshakeStatus::Uninitialized,
            role: None,
            greeting_seen: false,
            ack_seen: false,
        }
    }

    /// Role chosen by `prepare_*`, if any.
    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        self.role
    }

    fn expect(&self, expected: HandshakeStatus) -> Result<(), HandshakeError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState {
                expected: expected.as_str(),
                actual: self.status.as_str(),
            })
        }
    }

    fn fail(&mut self, reason: String) -> HandshakeError {
        self.status = HandshakeStatus::Failed;
        trace!(%reason, "handshake failed");
        HandshakeError::UnexpectedMessage(reason)
    }

    fn check_version(&mut self, msg: &Message) -> Result<(), HandshakeError> {
        if msg.payload() == PROTOCOL_VERSION.as_bytes() {
            Ok(())
        } else {
            let theirs = String::from_utf8_lossy(msg.payload()).into_owned();
            Err(self.fail(format!(
                "protocol mismatch: ours {PROTOCOL_VERSION}, theirs {theirs}"
            )))
        }
    }
}

impl Default for PlainHandshaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshaker for PlainHandshaker {
    fn prepare_initiator(&mut self) -> Result<(), HandshakeError> {
        self.expect(HandshakeStatus::Uninitialized)?;
        self.role = Some(Role::Initiator);
        self.status = HandshakeStatus::Prepared;
        Ok(())
    }

    fn prepare_responder(&mut self) -> Result<(), HandshakeError> {
        self.expect(HandshakeStatus::Uninitialized)?;
        self.role = Some(Role::Responder);
        self.status = HandshakeStatus::InProgress;
        Ok(())
    }

    fn status(&self) -> HandshakeStatus {
        self.status
    }

    fn first_message(&mut self) -> Result<Message, HandshakeError> {
        if self.role != Some(Role::Initiator) {
            return Err(HandshakeError::InvalidState {
                expected: "initiator",
                actual: "responder",
            });
        }
        self.expect(HandshakeStatus::Prepared)?;
        self.status = HandshakeStatus::InProgress;
        trace!("sending handshake greeting");
        Ok(Message::new(GREETING, PROTOCOL_VERSION.as_bytes()))
    }

    fn handle_message(&mut self, msg: &Message) -> Result<Option<Message>, HandshakeError> {
        self.expect(HandshakeStatus::InProgress)?;

        match (self.role, msg.code()) {
            (Some(Role::Responder), GREETING) if !self.greeting_seen => {
                self.check_version(msg)?;
                self.greeting_seen = true;
                self.status = HandshakeStatus::Success;
                trace!("greeting accepted, acknowledging");
                Ok(Some(Message::new(ACK, PROTOCOL_VERSION.as_bytes())))
            }
            (Some(Role::Initiator), ACK) if !self.ack_seen => {
                self.check_version(msg)?;
                self.ack_seen = true;
                self.status = HandshakeStatus::Success;
                trace!("acknowledgment received");
                Ok(None)
            }
            (role, code) => Err(self.fail(format!(
                "code {code:#04x} not expected by {role:?} in state {}",
                self.status.as_str()
            ))),
        }
    }
}
