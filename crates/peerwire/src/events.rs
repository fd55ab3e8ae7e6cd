//! Connect, disconnect and message fan-out.

use crate::connection::PeerConnection;
use crate::subscribers::{FailurePolicy, Subscribers, SubscriptionId};
use dashmap::DashMap;
use peerwire_common::frame::Message;
use peerwire_common::DisconnectReason;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A connection went away.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    /// The connection that closed.
    pub connection: PeerConnection,
    /// Why it closed.
    pub reason: DisconnectReason,
    /// `true` if the remote side ended it.
    pub by_peer: bool,
}

/// An application message received on an established connection.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Connection the message arrived on.
    pub connection: PeerConnection,
    /// The decoded message.
    pub message: Message,
}

/// User-facing event registries of one engine instance.
///
/// Every registry isolates callback failures. Subscription ids come from one
/// sequence, so an id names exactly one subscription across all registries.
#[derive(Debug)]
pub struct ConnectionEvents {
    ids: Arc<AtomicU64>,
    connect: Subscribers<PeerConnection>,
    disconnect: Subscribers<DisconnectEvent>,
    message: Subscribers<IncomingMessage>,
    by_code: DashMap<u32, Arc<Subscribers<IncomingMessage>>>,
}

impl ConnectionEvents {
    /// Creates empty registries.
    #[must_use]
    pub fn new() -> Self {
        let ids = Arc::new(AtomicU64::new(0));
        Self {
            connect: Subscribers::with_id_source(FailurePolicy::Isolate, Arc::clone(&ids)),
            disconnect: Subscribers::with_id_source(FailurePolicy::Isolate, Arc::clone(&ids)),
            message: Subscribers::with_id_source(FailurePolicy::Isolate, Arc::clone(&ids)),
            by_code: DashMap::new(),
            ids,
        }
    }

    /// Subscribes to newly established connections.
    pub fn subscribe_connect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PeerConnection) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.connect.subscribe(callback)
    }

    /// Subscribes to connection closures.
    pub fn subscribe_disconnect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DisconnectEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.disconnect.subscribe(callback)
    }

    /// Subscribes to every application message regardless of code.
    pub fn subscribe_message<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&IncomingMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.message.subscribe(callback)
    }

    /// Subscribes to application messages with one code.
    pub fn subscribe_code<F>(&self, code: u32, callback: F) -> SubscriptionId
    where
        F: Fn(&IncomingMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.by_code
            .entry(code)
            .or_insert_with(|| {
                Arc::new(Subscribers::with_id_source(
                    FailurePolicy::Isolate,
                    Arc::clone(&self.ids),
                ))
            })
            .subscribe(callback)
    }

    /// Hands every application message to a bounded channel.
    pub fn message_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<IncomingMessage>) {
        self.message.subscribe_channel(capacity)
    }

    /// Hands connect events to a bounded channel.
    pub fn connect_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<PeerConnection>) {
        self.connect.subscribe_channel(capacity)
    }

    /// Hands disconnect events to a bounded channel.
    pub fn disconnect_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<DisconnectEvent>) {
        self.disconnect.subscribe_channel(capacity)
    }

    /// Removes a subscription.
    ///
    /// With `code` the per-code registry for that code is searched, and
    /// dropped once it has no subscribers left. Without it the connect,
    /// disconnect and message registries are searched.
    pub fn unsubscribe(&self, id: SubscriptionId, code: Option<u32>) -> bool {
        match code {
            Some(code) => {
                let Some(registry) = self.by_code.get(&code).map(|r| Arc::clone(r.value()))
                else {
                    return false;
                };
                let removed = registry.unsubscribe(id);
                self.by_code.remove_if(&code, |_, r| r.is_empty());
                removed
            }
            None => {
                self.connect.unsubscribe(id)
                    || self.disconnect.unsubscribe(id)
                    || self.message.unsubscribe(id)
            }
        }
    }

    /// Number of codes with at least one subscriber.
    #[must_use]
    pub fn subscribed_codes(&self) -> usize {
        self.by_code.len()
    }

    pub(crate) fn dispatch_connect(&self, conn: &PeerConnection) {
        let _ = self.connect.dispatch(conn);
    }

    pub(crate) fn dispatch_disconnect(&self, event: &DisconnectEvent) {
        let _ = self.disconnect.dispatch(event);
    }

    /// Global message subscribers first, then the per-code ones.
    pub(crate) fn dispatch_message(&self, event: &IncomingMessage) {
        let _ = self.message.dispatch(event);
        let per_code = self
            .by_code
            .get(&event.message.code())
            .map(|r| Arc::clone(r.value()));
        if let Some(registry) = per_code {
            let _ = registry.dispatch(event);
        }
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new()
    }
}
