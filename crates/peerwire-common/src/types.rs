//! Protocol constants and reserved message codes.

/// Protocol identifier carried in the handshake greeting.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "peerwire/1";

/// Reserved message codes. Application codes start at [`code::FIRST_APPLICATION`].
pub mod code {
    /// First post-handshake frame; payload is the sender's UTF-8 identity.
    pub const HELLO: u32 = 0x00;
    /// Graceful close; payload is a single reason byte.
    pub const DISCONNECT: u32 = 0x01;
    /// Keepalive probe.
    pub const PING: u32 = 0x02;
    /// Keepalive answer.
    pub const PONG: u32 = 0x03;
    /// Lowest code available to applications.
    pub const FIRST_APPLICATION: u32 = 0x04;

    /// Human readable name for a code, used in logs.
    #[must_use]
    pub const fn name(code: u32) -> &'static str {
        match code {
            HELLO => "hello",
            DISCONNECT => "disconnect",
            PING => "ping",
            PONG => "pong",
            _ => "application",
        }
    }

    /// Returns `true` for codes the engine handles itself.
    #[must_use]
    pub const fn is_reserved(code: u32) -> bool {
        code < FIRST_APPLICATION
    }
}

/// Why a connection was closed. Carried as the single payload byte of a
/// DISCONNECT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// No specific reason, or a reason byte this node does not know.
    Unknown,
    /// The peer sent a frame that could not be decoded or was out of order.
    InvalidMessageReceived,
    /// The peer kept answering requests with useless responses.
    UselessPeer,
    /// A newer connection to the same identity replaced this one.
    AlreadyConnected,
    /// The peer missed a keepalive or repeatedly timed out on requests.
    Timeout,
}

impl DisconnectReason {
    /// Wire byte for this reason.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0x00,
            Self::InvalidMessageReceived => 0x02,
            Self::UselessPeer => 0x03,
            Self::AlreadyConnected => 0x05,
            Self::Timeout => 0x0b,
        }
    }

    /// Maps a wire byte back to a reason; unknown bytes become [`Self::Unknown`].
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x02 => Self::InvalidMessageReceived,
            0x03 => Self::UselessPeer,
            0x05 => Self::AlreadyConnected,
            0x0b => Self::Timeout,
            _ => Self::Unknown,
        }
    }

    /// Short label used for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InvalidMessageReceived => "invalid_message_received",
            Self::UselessPeer => "useless_peer",
            Self::AlreadyConnected => "already_connected",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
