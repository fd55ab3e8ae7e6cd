#![allow(dead_code)]

use peerwire::transport::{ByteStream, MemoryNetwork, TcpTransport, Transport};
use peerwire::{Communication, Message, NodeConfig};
use peerwire_common::types::{code, PROTOCOL_VERSION};
use peerwire_common::FrameDecoder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn any_port() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

pub fn test_config(node_id: &str) -> NodeConfig {
    NodeConfig {
        listen: any_port(),
        node_id: node_id.into(),
        connect_timeout: 2,
        idle_timeout: 15,
        disconnect_grace_ms: 200,
        ..NodeConfig::default()
    }
}

pub async fn start_engine(
    config: &NodeConfig,
    transport: Arc<dyn Transport>,
) -> (Arc<Communication>, SocketAddr) {
    let comm = Arc::new(Communication::new(config, transport));
    let addr = comm.start().await.unwrap();
    (comm, addr)
}

pub async fn start_memory_engine(
    net: &MemoryNetwork,
    config: &NodeConfig,
) -> (Arc<Communication>, SocketAddr) {
    start_engine(config, Arc::new(net.transport(config.listen))).await
}

pub async fn start_tcp_engine(config: &NodeConfig) -> (Arc<Communication>, SocketAddr) {
    start_engine(config, Arc::new(TcpTransport::new(config.listen))).await
}

/// Next item from `rx`, failing the test after [`WAIT`].
pub async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// A hand-driven peer speaking the wire protocol directly.
pub struct RawPeer {
    stream: Box<dyn ByteStream>,
    decoder: FrameDecoder,
}

impl RawPeer {
    pub async fn dial(net: &MemoryNetwork, addr: SocketAddr) -> Self {
        let transport = net.transport(any_port());
        let channel = transport.connect_raw(&addr.to_string()).await.unwrap();
        Self {
            stream: channel.stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Runs the greeting as initiator and exchanges HELLO. Returns the
    /// engine's identity.
    pub async fn establish(&mut self, identity: &str) -> String {
        self.greet().await;
        let hello = self.recv().await.unwrap();
        assert_eq!(hello.code(), code::HELLO);
        self.send(&Message::hello(identity)).await;
        String::from_utf8(hello.into_payload()).unwrap()
    }

    /// Runs only the greeting/acknowledgment step.
    pub async fn greet(&mut self) {
        self.send(&Message::new(code::PING, PROTOCOL_VERSION.as_bytes()))
            .await;
        let ack = self.recv().await.unwrap();
        assert_eq!(ack.code(), code::PONG);
    }

    pub async fn send(&mut self, msg: &Message) {
        self.send_raw(&msg.encode().unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Next frame, or `None` once the engine closed the stream.
    pub async fn recv(&mut self) -> Option<Message> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(msg) = self.decoder.decode_next().unwrap() {
                return Some(msg);
            }
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }
}
