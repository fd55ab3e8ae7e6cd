//! Per-connection I/O task.
//!
//! One task owns each stream from accept or dial until close: it runs the
//! handshake and the HELLO exchange, then reads frames, writes queued
//! outbound frames and probes liveness, all serialized in one `select!` loop.

use crate::connection::{ConnectionParts, Outbound, PeerConnection};
use crate::error::{ConnectError, PeerwireError};
use crate::events::{ConnectionEvents, DisconnectEvent, IncomingMessage};
use crate::handshake::{HandshakeStatus, HandshakerFactory, Role};
use crate::keepalive::{KeepAlive, KeepAliveAction};
use crate::metrics::{counters, gauges, histograms};
use crate::registry::ConnectionRegistry;
use crate::reputation::ReputationBook;
use crate::subscribers::Subscribers;
use crate::transport::{ByteStream, RawChannel, Transport};
use peerwire_common::frame::{FrameDecoder, Message};
use peerwire_common::types::code;
use peerwire_common::DisconnectReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace};

const READ_CHUNK: usize = 8 * 1024;

/// Timing and size limits applied to every connection.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub disconnect_grace: Duration,
    pub max_frame_size: usize,
}

/// Everything a connection task shares with its engine.
pub(crate) struct SessionContext {
    pub local_identity: String,
    pub settings: SessionSettings,
    pub handshakers: HandshakerFactory,
    pub registry: Arc<ConnectionRegistry>,
    pub events: Arc<ConnectionEvents>,
    pub lifecycle: Arc<Subscribers<DisconnectEvent>>,
    pub reputations: Arc<ReputationBook>,
    pub shutdown: watch::Receiver<bool>,
}

type Reader = ReadHalf<Box<dyn ByteStream>>;
type Writer = WriteHalf<Box<dyn ByteStream>>;

/// Framed reader over the read half of a stream.
struct FrameReader {
    reader: Reader,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl FrameReader {
    /// Next complete message, or `None` at end of stream. Cancel-safe:
    /// bytes already read stay buffered in the decoder.
    async fn next_message(&mut self) -> Result<Option<Message>, PeerwireError> {
        loop {
            if let Some(msg) = self.decoder.decode_next()? {
                return Ok(Some(msg));
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    /// Discards input until the peer closes or `grace` runs out.
    async fn drain(mut self, grace: Duration) {
        let _ = timeout(grace, async move {
            loop {
                match self.reader.read(&mut self.chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}

async fn write_frame(writer: &mut Writer, msg: &Message) -> Result<(), PeerwireError> {
    let bytes = msg.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Both halves of a stream during establishment, when reads and writes
/// strictly alternate.
struct FrameIo {
    reader: FrameReader,
    writer: Writer,
}

impl FrameIo {
    fn new(stream: Box<dyn ByteStream>, max_frame_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                reader,
                decoder: FrameDecoder::with_max_frame_size(max_frame_size),
                chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
            },
            writer,
        }
    }

    async fn next_message(&mut self) -> Result<Option<Message>, PeerwireError> {
        self.reader.next_message().await
    }

    async fn write(&mut self, msg: &Message) -> Result<(), PeerwireError> {
        write_frame(&mut self.writer, msg).await
    }
}

/// How a connection's writer task ended.
enum WriterExit {
    /// Asked to close, with the grace period to keep reading for.
    Closed(Option<Duration>),
    /// A write failed.
    Failed,
}

/// Drains the outbound queue onto the stream.
///
/// Runs on its own task so a peer that is slow to read never stops the
/// connection from reading.
async fn write_loop(
    mut writer: Writer,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    identity: String,
) -> WriterExit {
    while let Some(cmd) = outbound_rx.recv().await {
        match cmd {
            Outbound::Frame(msg) => {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    debug!(peer = %identity, error = %e, "write failed");
                    return WriterExit::Failed;
                }
                if !code::is_reserved(msg.code()) {
                    counters::messages_total("out");
                }
            }
            Outbound::Close { after } => {
                let _ = writer.shutdown().await;
                return WriterExit::Closed(after);
            }
        }
    }
    WriterExit::Closed(None)
}

/// A connection that finished HELLO but has not been activated yet.
struct Established {
    conn: PeerConnection,
    io: FrameIo,
    /// Engine-internal sender for PING/PONG, usable while closing.
    control: mpsc::UnboundedSender<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Dials `endpoint`, establishes the connection and runs it to completion.
/// The establishment result is reported on `done` as soon as it is known.
pub(crate) async fn run_outbound(
    ctx: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
    endpoint: String,
    done: oneshot::Sender<Result<PeerConnection, ConnectError>>,
) {
    let started = Instant::now();
    let attempt = async {
        let channel = transport.connect_raw(&endpoint).await?;
        establish(&ctx, channel, Role::Initiator, endpoint.clone()).await
    };

    match bounded(&ctx, attempt).await {
        Ok(est) => {
            histograms::connect_latency_seconds(started.elapsed().as_secs_f64());
            debug!(peer = %est.conn.identity(), %endpoint, "outbound connection established");
            activate(&ctx, &est.conn);
            let _ = done.send(Ok(est.conn.clone()));
            ctx.events.dispatch_connect(&est.conn);
            drive(&ctx, est).await;
        }
        Err(e) => {
            debug!(%endpoint, error = %e, "outbound connection failed");
            let _ = done.send(Err(e));
        }
    }
}

/// Establishes an accepted stream and runs it to completion.
pub(crate) async fn run_inbound(ctx: Arc<SessionContext>, channel: RawChannel) {
    let remote_addr = channel.remote_addr;
    let endpoint = remote_addr.to_string();

    match bounded(&ctx, establish(&ctx, channel, Role::Responder, endpoint)).await {
        Ok(est) => {
            debug!(peer = %est.conn.identity(), %remote_addr, "inbound connection established");
            activate(&ctx, &est.conn);
            ctx.events.dispatch_connect(&est.conn);
            drive(&ctx, est).await;
        }
        Err(e) => {
            debug!(%remote_addr, error = %e, "inbound connection failed");
        }
    }
}

/// Applies the connect timeout and shutdown signal to an establishment
/// attempt. Dropping the attempt drops the stream, which closes it.
async fn bounded<F>(ctx: &SessionContext, attempt: F) -> Result<Established, ConnectError>
where
    F: std::future::Future<Output = Result<Established, ConnectError>>,
{
    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return Err(ConnectError::Shutdown);
    }

    let result = tokio::select! {
        res = timeout(ctx.settings.connect_timeout, attempt) => {
            res.unwrap_or(Err(ConnectError::Timeout))
        }
        () = shutdown_requested(&mut shutdown) => Err(ConnectError::Shutdown),
    };

    counters::handshakes_total(match &result {
        Ok(_) => "success",
        Err(ConnectError::Timeout) => "timeout",
        Err(_) => "failed",
    });
    result
}

/// Resolves once the engine signals stop, or is dropped.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Handshake, then HELLO in both directions.
async fn establish(
    ctx: &SessionContext,
    channel: RawChannel,
    role: Role,
    endpoint: String,
) -> Result<Established, ConnectError> {
    let mut io = FrameIo::new(channel.stream, ctx.settings.max_frame_size);
    let mut handshaker = (ctx.handshakers)();

    match role {
        Role::Initiator => {
            handshaker.prepare_initiator()?;
            let first = handshaker.first_message()?;
            io.write(&first).await?;
        }
        Role::Responder => handshaker.prepare_responder()?,
    }

    while handshaker.status() != HandshakeStatus::Success {
        let msg = next_or_closed(&mut io, "handshake").await?;
        trace!(code = msg.code(), "handshake message");
        if let Some(reply) = handshaker.handle_message(&msg)? {
            io.write(&reply).await?;
        }
    }

    io.write(&Message::hello(&ctx.local_identity)).await?;
    let first = next_or_closed(&mut io, "hello").await?;
    let identity = match first.code() {
        code::HELLO => std::str::from_utf8(first.payload())
            .ok()
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or(ConnectError::InvalidHello)?,
        code::DISCONNECT => {
            let reason = first.disconnect_reason().unwrap_or(DisconnectReason::Unknown);
            return Err(ConnectError::DisconnectedBeforeHello(reason));
        }
        other => {
            let _ = io.write(&Message::disconnect(DisconnectReason::Unknown)).await;
            return Err(ConnectError::UnexpectedFirstMessage(other));
        }
    };

    let (tx, outbound_rx) = mpsc::unbounded_channel();
    let conn = PeerConnection::new(ConnectionParts {
        identity,
        endpoint,
        remote_addr: channel.remote_addr,
        initiated_locally: role == Role::Initiator,
        tx: tx.clone(),
        disconnect_grace: ctx.settings.disconnect_grace,
        lifecycle: Arc::clone(&ctx.lifecycle),
    });
    Ok(Established {
        conn,
        io,
        control: tx,
        outbound_rx,
    })
}

async fn next_or_closed(io: &mut FrameIo, phase: &str) -> Result<Message, ConnectError> {
    io.next_message()
        .await?
        .ok_or_else(|| ConnectError::Transport(format!("stream closed during {phase}")))
}

/// Marks the connection established and registers it.
fn activate(ctx: &SessionContext, conn: &PeerConnection) {
    conn.mark_established();
    ctx.registry.register(conn.clone());
    ctx.reputations.track(conn.identity());
    gauges::inc_connections_active();
}

/// Post-handshake loop. Returns once the connection is closed.
///
/// Reads, keepalive and shutdown are handled here; writes happen on a
/// separate writer task fed by the connection's outbound queue.
async fn drive(ctx: &SessionContext, est: Established) {
    let Established {
        conn,
        io,
        control,
        outbound_rx,
    } = est;
    let FrameIo { mut reader, writer } = io;
    let mut writer_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        conn.identity().to_owned(),
    ));

    let idle = ctx.settings.idle_timeout;
    let mut keepalive = KeepAlive::new();
    let mut idle_deadline = Instant::now() + idle;
    let mut reading = true;
    let mut shutdown = ctx.shutdown.clone();

    let closing = loop {
        tokio::select! {
            read = reader.next_message(), if reading => {
                idle_deadline = Instant::now() + idle;
                match read {
                    Ok(Some(msg)) => {
                        if !handle_frame(ctx, &conn, &control, &mut keepalive, msg) {
                            break None;
                        }
                    }
                    Ok(None) => {
                        conn.terminate(DisconnectReason::Unknown, true);
                        break None;
                    }
                    Err(PeerwireError::Frame(e)) => {
                        counters::malformed_frames_total();
                        debug!(peer = %conn.identity(), error = %e, "malformed frame");
                        reading = false;
                        conn.disconnect(DisconnectReason::InvalidMessageReceived);
                    }
                    Err(e) => {
                        debug!(peer = %conn.identity(), error = %e, "read failed");
                        conn.terminate(DisconnectReason::Unknown, false);
                        break None;
                    }
                }
            }
            exit = &mut writer_task => {
                match exit {
                    Ok(WriterExit::Closed(after)) => break after,
                    Ok(WriterExit::Failed) | Err(_) => {
                        conn.terminate(DisconnectReason::Unknown, false);
                        break None;
                    }
                }
            }
            () = sleep_until(idle_deadline), if reading => {
                match keepalive.on_idle() {
                    KeepAliveAction::SendPing => {
                        trace!(peer = %conn.identity(), "idle, sending ping");
                        idle_deadline = Instant::now() + idle;
                        if control.send(Outbound::Frame(Message::ping())).is_err() {
                            conn.terminate(DisconnectReason::Unknown, false);
                            break None;
                        }
                    }
                    KeepAliveAction::Disconnect(reason) => {
                        debug!(peer = %conn.identity(), "no pong before idle timeout");
                        reading = false;
                        conn.disconnect(reason);
                    }
                }
            }
            () = shutdown_requested(&mut shutdown) => {
                // Let the writer flush what is already queued, normally the
                // DISCONNECT from stop.
                conn.terminate(DisconnectReason::Unknown, false);
                let _ = timeout(ctx.settings.disconnect_grace, &mut writer_task).await;
                break None;
            }
        }
    };

    conn.terminate(DisconnectReason::Unknown, false);
    writer_task.abort();
    gauges::dec_connections_active();
    if let Some(grace) = closing {
        reader.drain(grace).await;
    }
    trace!(peer = %conn.identity(), "connection task finished");
}

/// Handles one inbound frame. Returns `false` when the connection ended.
fn handle_frame(
    ctx: &SessionContext,
    conn: &PeerConnection,
    control: &mpsc::UnboundedSender<Outbound>,
    keepalive: &mut KeepAlive,
    msg: Message,
) -> bool {
    match msg.code() {
        code::PING => {
            trace!(peer = %conn.identity(), "ping, replying pong");
            if control.send(Outbound::Frame(Message::pong())).is_err() {
                conn.terminate(DisconnectReason::Unknown, false);
                return false;
            }
        }
        code::PONG => {
            trace!(peer = %conn.identity(), "pong");
            keepalive.on_pong();
        }
        code::DISCONNECT => {
            let reason = msg.disconnect_reason().unwrap_or(DisconnectReason::Unknown);
            debug!(peer = %conn.identity(), %reason, "peer disconnected");
            conn.terminate(reason, true);
            return false;
        }
        code::HELLO => {
            debug!(peer = %conn.identity(), "ignoring repeated hello");
        }
        _ if conn.is_open() => {
            counters::messages_total("in");
            ctx.events.dispatch_message(&IncomingMessage {
                connection: conn.clone(),
                message: msg,
            });
        }
        _ => trace!(peer = %conn.identity(), "dropping message received while closing"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::plain_handshaker_factory;
    use crate::reputation::ReputationConfig;
    use crate::subscribers::FailurePolicy;
    use peerwire_common::types::PROTOCOL_VERSION;
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;

    fn context(shutdown: watch::Receiver<bool>) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            local_identity: "local".into(),
            settings: SessionSettings {
                connect_timeout: Duration::from_millis(500),
                idle_timeout: Duration::from_secs(15),
                disconnect_grace: Duration::from_millis(50),
                max_frame_size: 1024,
            },
            handshakers: plain_handshaker_factory(),
            registry: Arc::new(ConnectionRegistry::new()),
            events: Arc::new(ConnectionEvents::new()),
            lifecycle: Arc::new(Subscribers::new(FailurePolicy::Propagate)),
            reputations: Arc::new(ReputationBook::new(ReputationConfig::default())),
            shutdown,
        })
    }

    fn channel(stream: DuplexStream) -> RawChannel {
        RawChannel::new(stream, SocketAddr::from(([127, 0, 0, 1], 7)))
    }

    async fn read_message(stream: &mut DuplexStream, decoder: &mut FrameDecoder) -> Message {
        let mut buf = [0u8; 256];
        loop {
            if let Some(m) = decoder.decode_next().unwrap() {
                return m;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            decoder.extend(&buf[..n]);
        }
    }

    async fn write_message(stream: &mut DuplexStream, msg: &Message) {
        stream.write_all(&msg.encode().unwrap()).await.unwrap();
    }

    /// Plays the initiator side of the handshake by hand.
    async fn greet(stream: &mut DuplexStream, decoder: &mut FrameDecoder) {
        let greeting = Message::new(code::PING, PROTOCOL_VERSION.as_bytes());
        write_message(stream, &greeting).await;
        let ack = read_message(stream, decoder).await;
        assert_eq!(ack.code(), code::PONG);
    }

    #[tokio::test]
    async fn responder_rejects_ack_before_greeting() {
        let (_tx, rx) = watch::channel(false);
        let ctx = context(rx);
        let (ours, mut theirs) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            bounded(&ctx, establish(&ctx, channel(ours), Role::Responder, "e".into()))
                .await
                .map(|est| est.conn.identity().to_owned())
        });
        let ack = Message::new(code::PONG, PROTOCOL_VERSION.as_bytes());
        write_message(&mut theirs, &ack).await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Handshake(_))));
    }

    #[tokio::test]
    async fn non_hello_first_frame_gets_disconnect_reply() {
        let (_tx, rx) = watch::channel(false);
        let ctx = context(rx);
        let (ours, mut theirs) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            bounded(&ctx, establish(&ctx, channel(ours), Role::Responder, "e".into()))
                .await
                .map(|est| est.conn.identity().to_owned())
        });

        let mut decoder = FrameDecoder::new();
        greet(&mut theirs, &mut decoder).await;
        let hello = read_message(&mut theirs, &mut decoder).await;
        assert_eq!(hello.payload(), b"local");

        write_message(&mut theirs, &Message::new(0x10, b"too early".to_vec())).await;
        let reply = read_message(&mut theirs, &mut decoder).await;
        assert_eq!(reply.disconnect_reason(), Some(DisconnectReason::Unknown));
        assert_eq!(
            task.await.unwrap(),
            Err(ConnectError::UnexpectedFirstMessage(0x10))
        );
    }

    #[tokio::test]
    async fn disconnect_before_hello_fails_establishment() {
        let (_tx, rx) = watch::channel(false);
        let ctx = context(rx);
        let (ours, mut theirs) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            bounded(&ctx, establish(&ctx, channel(ours), Role::Responder, "e".into()))
                .await
                .map(|est| est.conn.identity().to_owned())
        });

        let mut decoder = FrameDecoder::new();
        greet(&mut theirs, &mut decoder).await;
        write_message(&mut theirs, &Message::disconnect(DisconnectReason::Timeout)).await;

        assert_eq!(
            task.await.unwrap(),
            Err(ConnectError::DisconnectedBeforeHello(DisconnectReason::Timeout))
        );
    }

    #[tokio::test]
    async fn hello_sets_identity() {
        let (_tx, rx) = watch::channel(false);
        let ctx = context(rx);
        let (ours, mut theirs) = tokio::io::duplex(4096);

        let task = tokio::spawn(async move {
            bounded(&ctx, establish(&ctx, channel(ours), Role::Responder, "e".into()))
                .await
                .map(|est| est.conn.identity().to_owned())
        });

        let mut decoder = FrameDecoder::new();
        greet(&mut theirs, &mut decoder).await;
        write_message(&mut theirs, &Message::hello("remote-node")).await;

        assert_eq!(task.await.unwrap(), Ok("remote-node".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (_tx, rx) = watch::channel(false);
        let ctx = context(rx);
        let (ours, _theirs) = tokio::io::duplex(4096);

        let attempt = establish(&ctx, channel(ours), Role::Responder, "e".into());
        let result = bounded(&ctx, attempt).await;
        assert!(matches!(result, Err(ConnectError::Timeout)));
    }

    #[tokio::test]
    async fn shutdown_aborts_establishment() {
        let (tx, rx) = watch::channel(false);
        let ctx = context(rx);
        let (ours, _theirs) = tokio::io::duplex(4096);

        tx.send(true).unwrap();
        let attempt = establish(&ctx, channel(ours), Role::Responder, "e".into());
        let result = bounded(&ctx, attempt).await;
        assert!(matches!(result, Err(ConnectError::Shutdown)));
    }
}
