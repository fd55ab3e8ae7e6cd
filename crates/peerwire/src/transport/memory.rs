use super::{RawChannel, Transport};
use crate::error::PeerwireError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_PORT: u16 = 40_000;

/// In-process network of [`MemoryTransport`]s joined by duplex pipes.
///
/// Clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    listeners: DashMap<SocketAddr, mpsc::Sender<RawChannel>>,
    dials: DashMap<String, usize>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport on this network. Port 0 picks a free port on start.
    #[must_use]
    pub fn transport(&self, listen: SocketAddr) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            listen,
            bound: Mutex::new(None),
        }
    }

    /// Listen at `addr` without an engine behind it; accepted streams go
    /// straight to the returned receiver.
    ///
    /// # Errors
    ///
    /// Fails if the address is already taken.
    pub fn bind_raw(
        &self,
        addr: SocketAddr,
    ) -> Result<mpsc::Receiver<RawChannel>, PeerwireError> {
        let (tx, rx) = mpsc::channel(16);
        self.bind(addr, tx)?;
        Ok(rx)
    }

    /// How many times `endpoint` has been dialed.
    #[must_use]
    pub fn dial_count(&self, endpoint: &str) -> usize {
        self.inner.dials.get(endpoint).map_or(0, |c| *c)
    }

    fn bind(
        &self,
        addr: SocketAddr,
        tx: mpsc::Sender<RawChannel>,
    ) -> Result<SocketAddr, PeerwireError> {
        let addr = if addr.port() == 0 {
            let offset = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
            let port = FIRST_PORT.wrapping_add(offset);
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };
        match self.inner.listeners.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PeerwireError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(addr)
            }
        }
    }

    fn unbind(&self, addr: SocketAddr) {
        self.inner.listeners.remove(&addr);
    }

    async fn dial(&self, from: SocketAddr, endpoint: &str) -> Result<RawChannel, PeerwireError> {
        *self.inner.dials.entry(endpoint.to_owned()).or_insert(0) += 1;

        let target: SocketAddr = endpoint
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{endpoint}: {e}")))?;
        let listener = self
            .inner
            .listeners
            .get(&target)
            .map(|l| l.value().clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send(RawChannel::new(remote, from))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(RawChannel::new(local, target))
    }
}

/// A transport on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    listen: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
}

impl MemoryTransport {
    /// Address this transport is bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, incoming: mpsc::Sender<RawChannel>) -> Result<SocketAddr, PeerwireError> {
        let addr = self.network.bind(self.listen, incoming)?;
        *self.bound.lock() = Some(addr);
        Ok(addr)
    }

    async fn stop(&self) -> Result<(), PeerwireError> {
        let bound = self.bound.lock().take();
        if let Some(addr) = bound {
            self.network.unbind(addr);
        }
        Ok(())
    }

    async fn connect_raw(&self, endpoint: &str) -> Result<RawChannel, PeerwireError> {
        let from = self.local_addr().unwrap_or(self.listen);
        self.network.dial(from, endpoint).await
    }
}
