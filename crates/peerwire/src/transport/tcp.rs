use super::{RawChannel, Transport};
use crate::error::PeerwireError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Plain TCP transport.
pub struct TcpTransport {
    listen: SocketAddr,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown_tx: watch::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// A transport that will listen on `listen`. Port 0 picks an ephemeral
    /// port.
    #[must_use]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self, incoming: mpsc::Sender<RawChannel>) -> Result<SocketAddr, PeerwireError> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let accept_task = tokio::spawn(accept_loop(listener, incoming, shutdown_rx));
        *self.running.lock() = Some(Running {
            shutdown_tx,
            accept_task,
        });
        info!("listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn stop(&self) -> Result<(), PeerwireError> {
        let running = self.running.lock().take();
        if let Some(Running {
            shutdown_tx,
            accept_task,
        }) = running
        {
            drop(shutdown_tx);
            if let Err(e) = accept_task.await {
                debug!("accept task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    async fn connect_raw(&self, endpoint: &str) -> Result<RawChannel, PeerwireError> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        Ok(RawChannel::new(stream, remote_addr))
    }
}

async fn accept_loop(
    listener: TcpListener,
    incoming: mpsc::Sender<RawChannel>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        if incoming.send(RawChannel::new(stream, addr)).await.is_err() {
                            debug!("engine no longer accepting, closing listener");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("listener shutting down");
                break;
            }
        }
    }
}
