//! Registry of subscribed outbound peers.
//!
//! A peer moves from connected to closed exactly once. Whoever wins the
//! `unregister` call owns the shutdown of its writer; every other caller gets
//! `None`. Closing a peer also cancels its `closed` token, which is how the
//! task reading the other half of the socket learns it has to let go.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    writer: Mutex<PeerWriter>,
    alive: AtomicBool,
    closed: CancellationToken,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Cancelled once the peer is removed or the registry shuts down.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Write the whole payload within `timeout`. A write that makes no
    /// progress surfaces as `WriteZero`, a stalled one as `TimedOut`.
    pub async fn send(&self, payload: &[u8], timeout: Duration) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "peer closed"));
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(payload).await?;
            writer.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", timeout),
            )),
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.closed.cancel();
        // A peer stuck mid-write still holds the lock; it is dropped with the
        // last Arc instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every peer's `closed` token is a child of `shutdown`.
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            ..Self::default()
        }
    }

    pub async fn register(&self, addr: SocketAddr, writer: PeerWriter) -> PeerId {
        self.register_with_close(addr, writer).await.0
    }

    /// Register a peer and hand back the token that fires when it is closed.
    pub async fn register_with_close(&self, addr: SocketAddr, writer: PeerWriter) -> (PeerId, CancellationToken) {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let closed = self.shutdown.child_token();
        let peer = Arc::new(Peer {
            id,
            addr,
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
            closed: closed.clone(),
        });

        let count = {
            let mut peers = self.peers.write().await;
            peers.insert(id, peer);
            peers.len()
        };
        info!(peer = %id, %addr, subscribers = count, "subscriber registered");
        (id, closed)
    }

    /// Remove and close a peer. Only the first call for a given id returns it.
    pub async fn unregister(&self, id: PeerId) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(&id)?;
        removed.close().await;
        debug!(peer = %id, addr = %removed.addr, "subscriber removed");
        Some(removed)
    }

    /// Live peers at this instant; the lock is released before any I/O.
    pub async fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: PeerId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<Peer>> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in &drained {
            peer.close().await;
        }
        if !drained.is_empty() {
            info!(closed = drained.len(), "closed all subscribers");
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn unregister_happens_at_most_once() {
        let registry = ListenerRegistry::new();
        let (client, _server) = tokio::io::duplex(64);
        let id = registry.register(addr(), Box::new(client)).await;

        assert_eq!(registry.len().await, 1);
        let first = registry.unregister(id).await.expect("registered");
        assert!(!first.is_alive());
        assert!(registry.unregister(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = ListenerRegistry::new();
        let mut ids = Vec::new();
        let mut ends = Vec::new();
        for _ in 0..5 {
            let (client, server) = tokio::io::duplex(64);
            ends.push(server);
            ids.push(registry.register(addr(), Box::new(client)).await);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert_eq!(registry.snapshot().await.len(), 5);
    }

    #[tokio::test]
    async fn send_delivers_and_closed_peer_refuses() {
        let registry = ListenerRegistry::new();
        let (client, mut server) = tokio::io::duplex(64);
        let id = registry.register(addr(), Box::new(client)).await;

        let peer = registry.snapshot().await.remove(0);
        peer.send(b"hello\n", Duration::from_millis(100)).await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        registry.unregister(id).await;
        let err = peer.send(b"again", Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn stalled_write_times_out() {
        let registry = ListenerRegistry::new();
        // Nobody reads the other end, so the second write cannot complete.
        let (client, _server) = tokio::io::duplex(4);
        registry.register(addr(), Box::new(client)).await;

        let peer = registry.snapshot().await.remove(0);
        let err = peer.send(b"0123456789", Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn removal_cancels_the_closed_token() {
        let registry = ListenerRegistry::new();
        let (a, _ra) = tokio::io::duplex(64);
        let (b, _rb) = tokio::io::duplex(64);
        let (removed, removed_closed) = registry.register_with_close(addr(), Box::new(a)).await;
        let (_kept, kept_closed) = registry.register_with_close(addr(), Box::new(b)).await;

        registry.unregister(removed).await;
        assert!(removed_closed.is_cancelled());
        assert!(!kept_closed.is_cancelled());

        registry.close_all().await;
        assert!(kept_closed.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_reaches_every_peer() {
        let shutdown = CancellationToken::new();
        let registry = ListenerRegistry::with_shutdown(shutdown.clone());
        let (a, _ra) = tokio::io::duplex(64);
        let (_, closed) = registry.register_with_close(addr(), Box::new(a)).await;

        shutdown.cancel();
        assert!(closed.is_cancelled());
        // Registration is untouched; only the readers are told to stop.
        assert_eq!(registry.len().await, 1);
        assert!(registry.snapshot().await[0].closed().is_cancelled());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = ListenerRegistry::new();
        let (a, _ra) = tokio::io::duplex(64);
        let (b, _rb) = tokio::io::duplex(64);
        registry.register(addr(), Box::new(a)).await;
        registry.register(addr(), Box::new(b)).await;

        let peers = registry.snapshot().await;
        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty().await);
        assert!(peers.iter().all(|p| !p.is_alive()));
    }
}
