//! The engine facade: start, stop, connect, send and subscribe.

use crate::config::NodeConfig;
use crate::connection::{PeerConnection, RemotePeer};
use crate::error::{ConnectError, PeerwireError};
use crate::events::{ConnectionEvents, DisconnectEvent, IncomingMessage};
use crate::handshake::{plain_handshaker_factory, HandshakerFactory};
use crate::metrics::NodeStatus;
use crate::registry::{ConnectFuture, ConnectionRegistry, PendingConnects};
use crate::reputation::{PeerReputation, ReputationBook};
use crate::session::{self, SessionContext, SessionSettings};
use crate::subscribers::{FailurePolicy, Subscribers, SubscriptionId};
use crate::transport::{RawChannel, Transport};
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use peerwire_common::frame::Message;
use peerwire_common::DisconnectReason;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepted streams waiting to be handed to a connection task.
const ACCEPT_BACKLOG: usize = 128;

/// A peer-to-peer connection engine.
///
/// One-shot lifecycle: [`start`](Self::start) once, [`stop`](Self::stop)
/// once. Several instances can live in one process; nothing is global.
pub struct Communication {
    transport: Arc<dyn Transport>,
    ctx: Arc<SessionContext>,
    pending: PendingConnects,
    responders: DashMap<u32, SubscriptionId>,
    correlation_ids: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Communication {
    /// An engine using the placeholder handshake.
    #[must_use]
    pub fn new(config: &NodeConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_handshaker(config, transport, plain_handshaker_factory())
    }

    /// An engine using `handshakers` to build each connection's handshake.
    #[must_use]
    pub fn with_handshaker(
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
        handshakers: HandshakerFactory,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let events = Arc::new(ConnectionEvents::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Internal hook run on every disconnect: drop the registry entry,
        // then tell user subscribers. The registry is referenced weakly
        // because it owns the connections that own this hook.
        let lifecycle = Arc::new(Subscribers::new(FailurePolicy::Propagate));
        let weak_registry: Weak<ConnectionRegistry> = Arc::downgrade(&registry);
        let hook_events = Arc::clone(&events);
        lifecycle.subscribe(move |event: &DisconnectEvent| {
            if let Some(registry) = weak_registry.upgrade() {
                registry.unregister(&event.connection);
            }
            hook_events.dispatch_disconnect(event);
            Ok(())
        });

        let ctx = Arc::new(SessionContext {
            local_identity: config.node_id.clone(),
            settings: SessionSettings {
                connect_timeout: config.connect_timeout(),
                idle_timeout: config.idle_timeout(),
                disconnect_grace: config.disconnect_grace(),
                max_frame_size: config.max_frame_size,
            },
            handshakers,
            registry,
            events,
            lifecycle,
            reputations: Arc::new(ReputationBook::new(config.reputation.clone())),
            shutdown: shutdown_rx,
        });

        Self {
            transport,
            ctx,
            pending: PendingConnects::new(config.pending_connect_ttl()),
            responders: DashMap::new(),
            correlation_ids: AtomicU64::new(1),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            accept_task: Mutex::new(None),
        }
    }

    /// Identity this node announces in HELLO.
    #[must_use]
    pub fn local_identity(&self) -> &str {
        &self.ctx.local_identity
    }

    /// Starts listening. Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`PeerwireError::AlreadyStarted`] on a second call, or the transport's
    /// bind error.
    pub async fn start(&self) -> Result<SocketAddr, PeerwireError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PeerwireError::AlreadyStarted);
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let addr = match self.transport.start(incoming_tx).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("failed to start transport, check for port conflicts: {}", e);
                return Err(e);
            }
        };

        let ctx = Arc::clone(&self.ctx);
        *self.accept_task.lock() = Some(tokio::spawn(accept_loop(ctx, incoming_rx)));
        info!(identity = %self.ctx.local_identity, "peerwire started and listening on {}", addr);
        Ok(addr)
    }

    /// Disconnects every peer, then releases the transport.
    ///
    /// Per-connection failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// [`PeerwireError::NotStarted`] before `start`,
    /// [`PeerwireError::AlreadyStopped`] on a second call.
    pub async fn stop(&self) -> Result<(), PeerwireError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(PeerwireError::NotStarted);
        }
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PeerwireError::AlreadyStopped);
        }

        let count = self.ctx.registry.disconnect_all(DisconnectReason::Unknown);
        debug!(count, "disconnected all peers");
        self.pending.clear();
        let _ = self.shutdown_tx.send(true);

        let transport_result = self.transport.stop().await;
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            task.abort();
        }
        info!("peerwire stopped");
        transport_result
    }

    /// Connects to `peer`, or joins an attempt already in flight for the
    /// same endpoint.
    ///
    /// On success the peer's identity is recorded on `peer`.
    ///
    /// # Errors
    ///
    /// The shared attempt's failure. [`ConnectError::Shutdown`] if the
    /// engine is not running.
    pub async fn connect(&self, peer: &RemotePeer) -> Result<PeerConnection, ConnectError> {
        if !self.is_running() {
            return Err(ConnectError::Shutdown);
        }
        let result = self.connect_future(peer.endpoint()).await;
        if let Ok(conn) = &result {
            peer.assign_identity(conn.identity());
        }
        result
    }

    fn connect_future(&self, endpoint: &str) -> ConnectFuture {
        let (future, created) = self.pending.get_or_create(endpoint, || {
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(session::run_outbound(
                Arc::clone(&self.ctx),
                Arc::clone(&self.transport),
                endpoint.to_owned(),
                done_tx,
            ));
            done_rx
                .map(|r| r.unwrap_or(Err(ConnectError::Aborted)))
                .boxed()
                .shared()
        });
        if !created {
            debug!(%endpoint, "joining pending connection attempt");
        }
        future
    }

    /// Sends `message` to the peer with this identity.
    ///
    /// A message without a correlation id gets the next id of this engine.
    /// Sending to an unknown or closed peer does nothing.
    pub fn send(&self, identity: &str, message: Message) {
        let Some(conn) = self.ctx.registry.get(identity) else {
            debug!(peer = %identity, "send to unknown peer dropped");
            return;
        };
        let message = if message.correlation_id().is_some() {
            message
        } else {
            let id = self.correlation_ids.fetch_add(1, Ordering::Relaxed);
            message.with_correlation_id(id.to_string())
        };
        if let Err(e) = conn.send(message) {
            debug!(peer = %identity, error = %e, "send dropped");
        }
    }

    /// Gracefully disconnects the peer with this identity, if connected.
    pub fn disconnect(&self, identity: &str, reason: DisconnectReason) {
        if let Some(conn) = self.ctx.registry.get(identity) {
            conn.disconnect(reason);
        }
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn connection(&self, identity: &str) -> Option<PeerConnection> {
        self.ctx.registry.get(identity)
    }

    /// Snapshot of the live connections.
    #[must_use]
    pub fn alive_connections(&self) -> Vec<PeerConnection> {
        self.ctx.registry.snapshot()
    }

    /// Subscribes to newly established connections.
    pub fn subscribe_connect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PeerConnection) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.events.subscribe_connect(callback)
    }

    /// Subscribes to closed connections.
    pub fn subscribe_disconnect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DisconnectEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.events.subscribe_disconnect(callback)
    }

    /// Subscribes to every application message.
    pub fn subscribe_message<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&IncomingMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.events.subscribe_message(callback)
    }

    /// Subscribes to application messages with `code`.
    pub fn subscribe_message_by_code<F>(&self, code: u32, callback: F) -> SubscriptionId
    where
        F: Fn(&IncomingMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.events.subscribe_code(code, callback)
    }

    /// The engine's event registries, for channel subscriptions.
    #[must_use]
    pub fn events(&self) -> &ConnectionEvents {
        &self.ctx.events
    }

    /// Removes a subscription. Pass the code for per-code subscriptions.
    pub fn unsubscribe(&self, id: SubscriptionId, code: Option<u32>) -> bool {
        if let Some(code) = code {
            self.responders.remove_if(&code, |_, rid| *rid == id);
        }
        self.ctx.events.unsubscribe(id, code)
    }

    /// Answers requests with `code`.
    ///
    /// `handler` returns the reply, which is sent back to the requesting peer
    /// with the request's correlation id. A handler error means the request
    /// was malformed: the peer is disconnected with
    /// [`DisconnectReason::Unknown`]. Registering again for the same code
    /// replaces the previous handler.
    pub fn respond_to<F>(&self, code: u32, handler: F) -> SubscriptionId
    where
        F: Fn(&IncomingMessage) -> anyhow::Result<Option<Message>> + Send + Sync + 'static,
    {
        let id = self.ctx.events.subscribe_code(code, move |incoming| {
            let conn = &incoming.connection;
            match handler(incoming) {
                Ok(Some(reply)) => {
                    let reply = match incoming.message.correlation_id() {
                        Some(cid) => reply.with_correlation_id(cid),
                        None => reply,
                    };
                    if let Err(e) = conn.send(reply) {
                        debug!(peer = %conn.identity(), error = %e, "reply dropped");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(peer = %conn.identity(), code, error = %e, "request handler failed");
                    conn.disconnect(DisconnectReason::Unknown);
                }
            }
            Ok(())
        });

        if let Some(previous) = self.responders.insert(code, id) {
            self.ctx.events.unsubscribe(previous, Some(code));
        }
        id
    }

    /// Records a timed-out request of `kind` against the peer and
    /// disconnects it if the reputation policy says so.
    pub fn record_request_timeout(&self, identity: &str, kind: u32) -> Option<DisconnectReason> {
        let verdict = self.with_reputation(identity, |r| r.record_request_timeout(kind))?;
        self.apply_verdict(identity, verdict)
    }

    /// Records a useless response from the peer and disconnects it if the
    /// reputation policy says so.
    pub fn record_useless_response(&self, identity: &str) -> Option<DisconnectReason> {
        let now = Instant::now();
        let verdict = self.with_reputation(identity, |r| r.record_useless_response(now))?;
        self.apply_verdict(identity, verdict)
    }

    /// Credits a useful response from the peer.
    pub fn record_useful_response(&self, identity: &str) {
        self.with_reputation(identity, PeerReputation::record_useful_response);
    }

    /// Clears the peer's timeout count for `kind`.
    pub fn reset_timeout_count(&self, identity: &str, kind: u32) {
        self.with_reputation(identity, |r| r.reset_timeout_count(kind));
    }

    /// Advisory score of a peer seen by this engine.
    #[must_use]
    pub fn reputation_score(&self, identity: &str) -> Option<i32> {
        self.ctx.reputations.score(identity)
    }

    fn with_reputation<T>(
        &self,
        identity: &str,
        f: impl FnOnce(&mut PeerReputation) -> T,
    ) -> Option<T> {
        // A connected peer whose record was pushed out starts over.
        if self.ctx.registry.get(identity).is_some() {
            self.ctx.reputations.track(identity);
        }
        self.ctx.reputations.update(identity, f)
    }

    fn apply_verdict(
        &self,
        identity: &str,
        verdict: Option<DisconnectReason>,
    ) -> Option<DisconnectReason> {
        let reason = verdict?;
        debug!(peer = %identity, %reason, "reputation verdict");
        self.disconnect(identity, reason);
        Some(reason)
    }

    /// Started and not yet stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }
}

impl NodeStatus for Communication {
    fn identity(&self) -> &str {
        self.local_identity()
    }

    fn is_running(&self) -> bool {
        Communication::is_running(self)
    }

    fn connection_count(&self) -> usize {
        self.ctx.registry.len()
    }
}

impl std::fmt::Debug for Communication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communication")
            .field("identity", &self.ctx.local_identity)
            .field("connections", &self.ctx.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Communication {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

/// Spawns a connection task for every accepted stream.
async fn accept_loop(ctx: Arc<SessionContext>, mut incoming: mpsc::Receiver<RawChannel>) {
    while let Some(channel) = incoming.recv().await {
        debug!(remote = %channel.remote_addr, "accepted connection");
        tokio::spawn(session::run_inbound(Arc::clone(&ctx), channel));
    }
}
