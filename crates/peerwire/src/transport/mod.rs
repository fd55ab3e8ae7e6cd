//! Byte-stream transports the engine runs on.
//!
//! A transport only moves bytes: it listens, accepts, dials and hands each
//! stream to the engine as a [`RawChannel`]. Framing, handshakes and
//! keepalive all happen above it.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::error::PeerwireError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// An ordered, reliable byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// One accepted or dialed stream.
pub struct RawChannel {
    /// The stream itself. Dropping it closes the connection.
    pub stream: Box<dyn ByteStream>,
    /// Address of the other end.
    pub remote_addr: SocketAddr,
}

impl RawChannel {
    /// Wrap a stream.
    pub fn new(stream: impl ByteStream + 'static, remote_addr: SocketAddr) -> Self {
        Self {
            stream: Box::new(stream),
            remote_addr,
        }
    }
}

impl std::fmt::Debug for RawChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawChannel")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Listening and dialing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting. Every accepted stream is sent to `incoming`.
    /// Returns the bound address.
    async fn start(&self, incoming: mpsc::Sender<RawChannel>) -> Result<SocketAddr, PeerwireError>;

    /// Stop accepting and release the listener.
    async fn stop(&self) -> Result<(), PeerwireError>;

    /// Open a stream to `endpoint` (`host:port`).
    async fn connect_raw(&self, endpoint: &str) -> Result<RawChannel, PeerwireError>;
}
