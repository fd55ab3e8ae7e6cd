use peerwire_common::FrameError;
use thiserror::Error;

/// Errors returned by the connection engine.
#[derive(Error, Debug)]
pub enum PeerwireError {
    /// `start` was called on an instance that is already running.
    #[error("already started")]
    AlreadyStarted,
    /// `stop` was called twice.
    #[error("already stopped")]
    AlreadyStopped,
    /// `stop` was called on an instance that was never started.
    #[error("not started")]
    NotStarted,
    /// The connection is closed; nothing more can be sent on it.
    #[error("connection closed")]
    ConnectionClosed,
    /// Frame encoding or decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// Handshake protocol violation.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    /// Establishing a connection failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake state machine violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// An operation was invoked in a state that does not allow it.
    #[error("invalid handshake state: expected {expected}, was {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: &'static str,
        /// State the handshake was in.
        actual: &'static str,
    },
    /// A message arrived that the current role does not expect.
    #[error("unexpected handshake message: {0}")]
    UnexpectedMessage(String),
}

/// Why a connection attempt failed.
///
/// Cloneable so that every caller sharing one deduplicated connect attempt
/// observes the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The handshake and HELLO exchange did not finish in time.
    #[error("timed out establishing connection")]
    Timeout,
    /// The handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The peer sent DISCONNECT before HELLO.
    #[error("peer disconnected before hello ({0})")]
    DisconnectedBeforeHello(peerwire_common::DisconnectReason),
    /// The first post-handshake frame was not HELLO.
    #[error("first message after handshake had code {0:#04x}, expected hello")]
    UnexpectedFirstMessage(u32),
    /// HELLO carried no usable identity.
    #[error("hello carried an invalid identity")]
    InvalidHello,
    /// A frame could not be decoded during establishment.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The transport failed to dial or the stream broke.
    #[error("transport error: {0}")]
    Transport(String),
    /// The engine is not running or is shutting down.
    #[error("engine is not running")]
    Shutdown,
    /// The connection task ended without reporting a result.
    #[error("connection attempt aborted")]
    Aborted,
}

impl From<HandshakeError> for ConnectError {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e.to_string())
    }
}

impl From<FrameError> for ConnectError {
    fn from(e: FrameError) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<PeerwireError> for ConnectError {
    fn from(e: PeerwireError) -> Self {
        match e {
            PeerwireError::Connect(c) => c,
            PeerwireError::Frame(f) => f.into(),
            PeerwireError::Handshake(h) => h.into(),
            PeerwireError::Io(io) => io.into(),
            other => Self::Transport(other.to_string()),
        }
    }
}
