use crate::error::PeerwireError;
use crate::events::DisconnectEvent;
use crate::metrics::counters;
use crate::subscribers::Subscribers;
use peerwire_common::frame::Message;
use peerwire_common::DisconnectReason;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle of a [`PeerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// HELLO received, not yet handed to the registry.
    Handshaking = 0,
    /// Registered and carrying application traffic.
    Established = 1,
    /// DISCONNECT sent, waiting for the grace period before closing.
    Disconnecting = 2,
    /// Closed. Sends fail.
    Terminated = 3,
}

impl LifecycleState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Handshaking,
            1 => Self::Established,
            2 => Self::Disconnecting,
            _ => Self::Terminated,
        }
    }

    const fn is_open(self) -> bool {
        matches!(self, Self::Handshaking | Self::Established)
    }
}

/// Commands from a [`PeerConnection`] handle to its I/O task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Encode and write one frame.
    Frame(Message),
    /// Close the transport, optionally after letting pending writes flush.
    Close { after: Option<Duration> },
}

/// A remote endpoint to dial, and the identity it turned out to have.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    endpoint: String,
    identity: Arc<OnceLock<String>>,
}

impl RemotePeer {
    /// A peer reachable at `endpoint` (`host:port`).
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: Arc::new(OnceLock::new()),
        }
    }

    /// Dial address.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identity learned from the peer's HELLO, once connected.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Assigns the identity. Only the first call has any effect.
    pub(crate) fn assign_identity(&self, identity: &str) -> bool {
        self.identity.set(identity.to_owned()).is_ok()
    }
}

struct Inner {
    identity: String,
    endpoint: String,
    remote_addr: SocketAddr,
    initiated_locally: bool,
    state: AtomicU8,
    tx: mpsc::UnboundedSender<Outbound>,
    disconnect_grace: Duration,
    lifecycle: Arc<Subscribers<DisconnectEvent>>,
}

/// Handle to one established peer connection.
///
/// Cheap to clone. The socket itself is owned by the connection's I/O task;
/// every handle talks to it through a channel, so a handle stays safe to use
/// after the connection is gone.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

/// Parts the I/O task needs to build a [`PeerConnection`].
pub(crate) struct ConnectionParts {
    pub identity: String,
    pub endpoint: String,
    pub remote_addr: SocketAddr,
    pub initiated_locally: bool,
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub disconnect_grace: Duration,
    pub lifecycle: Arc<Subscribers<DisconnectEvent>>,
}

impl PeerConnection {
    pub(crate) fn new(parts: ConnectionParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity: parts.identity,
                endpoint: parts.endpoint,
                remote_addr: parts.remote_addr,
                initiated_locally: parts.initiated_locally,
                state: AtomicU8::new(LifecycleState::Handshaking as u8),
                tx: parts.tx,
                disconnect_grace: parts.disconnect_grace,
                lifecycle: parts.lifecycle,
            }),
        }
    }

    /// Identity the peer declared in its HELLO.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Endpoint this connection was dialed at, or the remote socket address
    /// for accepted connections.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Remote socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// `true` if this node dialed the connection.
    #[must_use]
    pub fn initiated_locally(&self) -> bool {
        self.inner.initiated_locally
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// `true` while the connection accepts sends.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Whether two handles refer to the same underlying connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Moves `Handshaking -> Established`.
    pub(crate) fn mark_established(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                LifecycleState::Handshaking as u8,
                LifecycleState::Established as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Queues a message for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`PeerwireError::ConnectionClosed`] once a disconnect started
    /// or the I/O task has exited.
    pub fn send(&self, message: Message) -> Result<(), PeerwireError> {
        if !self.is_open() {
            return Err(PeerwireError::ConnectionClosed);
        }
        self.inner
            .tx
            .send(Outbound::Frame(message))
            .map_err(|_| PeerwireError::ConnectionClosed)
    }

    /// Gracefully disconnects: notifies subscribers, sends DISCONNECT and
    /// closes the transport after the grace period.
    ///
    /// Calling it again, or after termination, does nothing.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if !self.transition_from_open(LifecycleState::Disconnecting) {
            return;
        }
        debug!(peer = %self.identity(), %reason, "disconnecting");
        self.notify_disconnect(reason, false);

        // The I/O task may already be gone; then the transport is closed anyway.
        let _ = self.inner.tx.send(Outbound::Frame(Message::disconnect(reason)));
        let _ = self.inner.tx.send(Outbound::Close {
            after: Some(self.inner.disconnect_grace),
        });
    }

    /// Closes immediately without sending DISCONNECT. The disconnect event is
    /// only dispatched if [`disconnect`](Self::disconnect) has not already
    /// done so.
    pub(crate) fn terminate(&self, reason: DisconnectReason, by_peer: bool) {
        let prev = LifecycleState::from_u8(
            self.inner
                .state
                .swap(LifecycleState::Terminated as u8, Ordering::AcqRel),
        );
        if prev == LifecycleState::Terminated {
            return;
        }
        if prev.is_open() {
            debug!(peer = %self.identity(), %reason, by_peer, "connection terminated");
            self.notify_disconnect(reason, by_peer);
        }
        let _ = self.inner.tx.send(Outbound::Close { after: None });
    }

    fn transition_from_open(&self, next: LifecycleState) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if !LifecycleState::from_u8(current).is_open() {
                return false;
            }
            match self.inner.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn notify_disconnect(&self, reason: DisconnectReason, by_peer: bool) {
        counters::disconnects_total(reason.as_str());
        let event = DisconnectEvent {
            connection: self.clone(),
            reason,
            by_peer,
        };
        if let Err(e) = self.inner.lifecycle.dispatch(&event) {
            warn!(peer = %self.identity(), error = %e, "disconnect hook failed");
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("identity", &self.inner.identity)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
