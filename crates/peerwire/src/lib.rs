//! peerwire: a peer-to-peer connection engine.
//!
//! Establishes framed, handshaked, kept-alive byte-stream connections between
//! nodes and routes application messages to subscribers, while scoring peers
//! and disconnecting misbehaving ones.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod communication;
/// CLI argument parsing and node configuration.
pub mod config;
/// Handle to an established peer connection.
pub mod connection;
/// Error types for engine operations.
pub mod error;
pub mod events;
pub mod handshake;
pub mod keepalive;
pub mod metrics;
/// Live connection table and pending outbound connect cache.
pub mod registry;
/// Per-peer scoring and disconnect verdicts.
pub mod reputation;
mod session;
pub mod subscribers;
pub mod transport;

pub use communication::Communication;
pub use config::{Args, NodeConfig};
pub use connection::{LifecycleState, PeerConnection, RemotePeer};
pub use error::{ConnectError, HandshakeError, PeerwireError};
pub use events::{DisconnectEvent, IncomingMessage};
pub use peerwire_common::{DisconnectReason, Message};
