//! Length-prefixed binary framing.
//!
//! Every frame on the wire is laid out big-endian as:
//!
//! ```text
//! [i32 total_len][i32 correlation_id_len][correlation_id][i32 code][i32 payload_len][payload]
//! ```
//!
//! `total_len` covers every byte after itself. Decoding is incremental: a
//! partial frame is left in the buffer untouched until the rest arrives.

use crate::types::{code, DisconnectReason};
use thiserror::Error;

/// Size of each length or code field on the wire.
const FIELD_LEN: usize = 4;

/// Bytes of fixed overhead inside `total_len` (id length + code + payload length).
pub const FRAME_OVERHEAD: usize = 3 * FIELD_LEN;

/// Default ceiling for a declared `total_len` (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoded protocol message.
///
/// Immutable once constructed. An empty correlation id is normalized to
/// `None` because both encode to a zero-length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    code: u32,
    correlation_id: Option<String>,
    payload: Vec<u8>,
}

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A length field was negative.
    #[error("negative {field} length: {value}")]
    NegativeLength {
        /// Which length field was negative.
        field: &'static str,
        /// The raw value read from the wire.
        value: i32,
    },
    /// The declared total length is smaller than the fixed frame overhead.
    #[error("frame too short: need at least {min} bytes, declared {declared}")]
    TooShort {
        /// Minimum body length.
        min: usize,
        /// Declared body length.
        declared: usize,
    },
    /// The frame exceeds the configured maximum size.
    #[error("frame too large: max {max}, got {actual}")]
    FrameTooLarge {
        /// Maximum allowed frame size.
        max: usize,
        /// Declared or computed frame size.
        actual: usize,
    },
    /// Inner length fields do not add up to the declared total length.
    #[error("length mismatch: frame declares {declared} bytes, fields need {actual}")]
    LengthMismatch {
        /// Total length declared by the frame header.
        declared: usize,
        /// Length implied by the inner fields.
        actual: usize,
    },
    /// The correlation id is not valid UTF-8.
    #[error("correlation id is not valid utf-8")]
    InvalidCorrelationId,
}

impl Message {
    /// Creates a message with no correlation id.
    #[must_use]
    pub fn new(code: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            correlation_id: None,
            payload: payload.into(),
        }
    }

    /// Returns a copy of this message carrying `id` as its correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.correlation_id = if id.is_empty() { None } else { Some(id) };
        self
    }

    /// Creates a HELLO frame announcing `identity`.
    #[must_use]
    pub fn hello(identity: &str) -> Self {
        Self::new(code::HELLO, identity.as_bytes())
    }

    /// Creates a DISCONNECT frame carrying `reason`.
    #[must_use]
    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self::new(code::DISCONNECT, vec![reason.code()])
    }

    /// Creates a keepalive PING frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(code::PING, Vec::new())
    }

    /// Creates a keepalive PONG frame.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(code::PONG, Vec::new())
    }

    /// Message code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// Correlation id, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Message payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Reads the reason byte of a DISCONNECT frame.
    ///
    /// Returns `None` for any other code. A DISCONNECT with an empty payload
    /// yields [`DisconnectReason::Unknown`].
    #[must_use]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        if self.code != code::DISCONNECT {
            return None;
        }
        Some(
            self.payload
                .first()
                .map_or(DisconnectReason::Unknown, |b| DisconnectReason::from_code(*b)),
        )
    }

    /// Number of bytes this message occupies on the wire, length prefix included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIELD_LEN + self.body_len()
    }

    fn body_len(&self) -> usize {
        FRAME_OVERHEAD + self.correlation_id.as_ref().map_or(0, String::len) + self.payload.len()
    }

    /// Serializes this message into a single length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FrameTooLarge`] if the frame would not fit the
    /// 32-bit length field.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerwire_common::frame::Message;
    /// let bytes = Message::new(0x10, b"hi".to_vec()).encode().unwrap();
    /// assert_eq!(&bytes[..4], &[0, 0, 0, 14]);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Appends this message's frame to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FrameTooLarge`] if the frame would not fit the
    /// 32-bit length field. `out` is left untouched in that case.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        let body_len = self.body_len();
        let total = i32::try_from(body_len).map_err(|_| FrameError::FrameTooLarge {
            max: i32::MAX as usize,
            actual: body_len,
        })?;
        let id = self.correlation_id.as_deref().unwrap_or("").as_bytes();
        // Both inner lengths are bounded by `total`, which already fits.
        let id_len = id.len() as i32;
        let payload_len = self.payload.len() as i32;

        out.reserve(FIELD_LEN + body_len);
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&id_len.to_be_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame; the
    /// buffer is not modified in that case. On success the frame's bytes are
    /// removed from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for structurally invalid frames. The offending
    /// bytes are left in `buf`; the stream cannot be resynchronized.
    pub fn decode(buf: &mut Vec<u8>, max_frame_size: usize) -> Result<Option<Self>, FrameError> {
        let Some(header) = buf.get(..FIELD_LEN) else {
            return Ok(None);
        };
        let declared = read_len(header, "total")?;
        if declared < FRAME_OVERHEAD {
            return Err(FrameError::TooShort {
                min: FRAME_OVERHEAD,
                declared,
            });
        }
        if declared > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                max: max_frame_size,
                actual: declared,
            });
        }
        let Some(body) = buf.get(FIELD_LEN..FIELD_LEN + declared) else {
            return Ok(None);
        };

        let message = Self::parse_body(body, declared)?;
        buf.drain(..FIELD_LEN + declared);
        Ok(Some(message))
    }

    fn parse_body(body: &[u8], declared: usize) -> Result<Self, FrameError> {
        let id_len = read_len(&body[..FIELD_LEN], "correlation id")?;
        if FRAME_OVERHEAD + id_len > declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: FRAME_OVERHEAD + id_len,
            });
        }
        let id_end = FIELD_LEN + id_len;
        let id = std::str::from_utf8(&body[FIELD_LEN..id_end])
            .map_err(|_| FrameError::InvalidCorrelationId)?;

        let code = u32::from_be_bytes(field(&body[id_end..id_end + FIELD_LEN]));
        let payload_start = id_end + 2 * FIELD_LEN;
        let payload_len = read_len(&body[id_end + FIELD_LEN..payload_start], "payload")?;
        if payload_start + payload_len != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload_start + payload_len,
            });
        }

        Ok(Self::new(code, &body[payload_start..]).with_correlation_id(id))
    }
}

fn field(bytes: &[u8]) -> [u8; FIELD_LEN] {
    let mut out = [0u8; FIELD_LEN];
    out.copy_from_slice(bytes);
    out
}

fn read_len(bytes: &[u8], name: &'static str) -> Result<usize, FrameError> {
    let value = i32::from_be_bytes(field(bytes));
    usize::try_from(value).map_err(|_| FrameError::NegativeLength { field: name, value })
}

/// Incremental decoder that accumulates stream bytes and yields whole messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder with [`DEFAULT_MAX_FRAME_SIZE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder rejecting frames whose declared length exceeds `max`.
    #[must_use]
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_frame_size: max,
        }
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes the next complete message, or `Ok(None)` if more data is needed.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the buffered bytes are not a valid frame.
    pub fn decode_next(&mut self) -> Result<Option<Message>, FrameError> {
        Message::decode(&mut self.buf, self.max_frame_size)
    }

    /// Number of bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
