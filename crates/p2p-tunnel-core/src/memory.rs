//! In-process peer network.
//!
//! [`MemoryNetwork`] hosts any number of [`MemoryHost`] peers that reach each
//! other without sockets: a stream between two peers is a
//! [`tokio::io::duplex`] pipe. It implements the full [`PeerHost`] contract,
//! including handler dispatch and hard stream resets, so the tunnel layer can
//! be run end-to-end inside a single process.

use crate::error::{TunnelError, TunnelResult};
use crate::host::{AddressBook, BoxedStream, MemoryAddressBook, PeerHost, PeerInfo, PeerStream, StreamHandler};
use futures_util::future::BoxFuture;
use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::debug;

/// Buffer size of each in-memory stream pipe (64 KiB).
const PIPE_CAPACITY: usize = 64 * 1024;

/// First synthetic port handed out to memory peers.
const FIRST_PORT: u16 = 40001;

struct NetworkInner {
    peers: RwLock<HashMap<PeerId, Arc<MemoryHost>>>,
    next_port: AtomicU16,
}

/// A set of in-process peers that can dial each other.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                peers: RwLock::new(HashMap::new()),
                next_port: AtomicU16::new(FIRST_PORT),
            }),
        }
    }

    /// Add a peer with a random identity and a synthetic loopback address.
    ///
    /// Every existing peer learns the new peer's address and vice versa.
    pub fn add_peer(&self) -> Arc<MemoryHost> {
        let id = PeerId::random();
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::LOCALHOST))
            .with(Protocol::Tcp(port));

        let host = Arc::new(MemoryHost {
            id,
            addr: addr.clone(),
            network: Arc::downgrade(&self.inner),
            handlers: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashSet::new()),
            address_book: Arc::new(MemoryAddressBook::new()),
            connect_delay: RwLock::new(None),
        });

        let mut peers = self.inner.peers.write().unwrap_or_else(PoisonError::into_inner);
        for other in peers.values() {
            other.address_book.add_addrs(id, &[addr.clone()]);
            host.address_book.add_addrs(other.id, &[other.addr.clone()]);
        }
        peers.insert(id, Arc::clone(&host));

        debug!(peer = %id, addr = %addr, "memory peer added");
        host
    }

    /// Remove a peer. Subsequent connects and stream opens to it fail;
    /// streams already open keep working until closed.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self
            .inner
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if let Some(host) = &removed {
            for other in self.peers() {
                other.forget(peer);
                host.forget(&other.id);
            }
        }
        removed.is_some()
    }

    /// All peers currently in the network.
    pub fn peers(&self) -> Vec<Arc<MemoryHost>> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// One peer of a [`MemoryNetwork`].
pub struct MemoryHost {
    id: PeerId,
    addr: Multiaddr,
    network: Weak<NetworkInner>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    connected: RwLock<HashSet<PeerId>>,
    address_book: Arc<MemoryAddressBook>,
    connect_delay: RwLock<Option<Duration>>,
}

impl MemoryHost {
    /// The synthetic listen address of this peer.
    pub fn addr(&self) -> &Multiaddr {
        &self.addr
    }

    /// The address book this peer fills as other peers join the network.
    pub fn address_book(&self) -> Arc<MemoryAddressBook> {
        Arc::clone(&self.address_book)
    }

    /// Delay every subsequent [`connect`](PeerHost::connect) by `delay`.
    ///
    /// Simulates a slow or unresponsive peer.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.write().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Whether a connection to `peer` has been established.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    /// Whether a handler is installed for `protocol`.
    pub fn has_handler(&self, protocol: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(protocol)
    }

    fn forget(&self, peer: &PeerId) {
        self.connected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<MemoryHost>> {
        let network = self.network.upgrade()?;
        let peers = network.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.get(peer).cloned()
    }

    fn handler_for(&self, protocol: &str) -> Option<StreamHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }
}

impl PeerHost for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol);
    }

    fn connect(&self, peer: PeerInfo) -> BoxFuture<'_, TunnelResult<()>> {
        Box::pin(async move {
            let delay = *self.connect_delay.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.is_connected(&peer.id) && self.lookup(&peer.id).is_some() {
                return Ok(());
            }

            let remote = self
                .lookup(&peer.id)
                .ok_or_else(|| TunnelError::PeerUnreachable(peer.id.to_string()))?;

            self.address_book.add_addrs(peer.id, &peer.addrs);
            self.connected
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(peer.id);
            remote
                .connected
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(self.id);

            debug!(local = %self.id, remote = %peer.id, "memory peers connected");
            Ok(())
        })
    }

    fn new_stream<'a>(
        &'a self,
        peer: PeerId,
        protocol: &'a str,
    ) -> BoxFuture<'a, TunnelResult<BoxedStream>> {
        Box::pin(async move {
            if !self.is_connected(&peer) {
                return Err(TunnelError::PeerUnreachable(format!("not connected to {peer}")));
            }
            let remote = self
                .lookup(&peer)
                .ok_or_else(|| TunnelError::PeerUnreachable(peer.to_string()))?;
            let handler = remote.handler_for(protocol).ok_or_else(|| {
                TunnelError::StreamOpen(format!("{peer} does not support protocol {protocol}"))
            })?;

            let (ours, theirs) = MemoryStream::pair(protocol, (self.id, &self.addr), (remote.id, &remote.addr));
            handler(Box::new(theirs));

            Ok(Box::new(ours) as BoxedStream)
        })
    }
}

/// One end of an in-memory peer stream.
pub struct MemoryStream {
    protocol: String,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    inner: Option<DuplexStream>,
    /// Set when this end resets.
    reset_local: Arc<AtomicBool>,
    /// Set when the other end resets.
    reset_remote: Arc<AtomicBool>,
}

impl MemoryStream {
    /// Create a connected pair. The first stream belongs to `a` and talks to
    /// `b`; the second belongs to `b` and talks to `a`.
    fn pair(
        protocol: &str,
        a: (PeerId, &Multiaddr),
        b: (PeerId, &Multiaddr),
    ) -> (MemoryStream, MemoryStream) {
        let (pipe_a, pipe_b) = tokio::io::duplex(PIPE_CAPACITY);
        let reset_a = Arc::new(AtomicBool::new(false));
        let reset_b = Arc::new(AtomicBool::new(false));

        let stream_a = MemoryStream {
            protocol: protocol.to_string(),
            remote_peer: b.0,
            remote_addr: b.1.clone(),
            inner: Some(pipe_a),
            reset_local: Arc::clone(&reset_a),
            reset_remote: Arc::clone(&reset_b),
        };
        let stream_b = MemoryStream {
            protocol: protocol.to_string(),
            remote_peer: a.0,
            remote_addr: a.1.clone(),
            inner: Some(pipe_b),
            reset_local: reset_b,
            reset_remote: reset_a,
        };
        (stream_a, stream_b)
    }

    fn check_remote_reset(&self) -> io::Result<()> {
        if self.reset_remote.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset by remote peer",
            ));
        }
        Ok(())
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream was reset")
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_remote_reset()?;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(closed_error()));
        };

        let before = buf.filled().len();
        match Pin::new(inner).poll_read(cx, buf) {
            // EOF caused by the remote resetting rather than shutting down.
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                Poll::Ready(this.check_remote_reset())
            }
            other => other,
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_remote_reset()?;
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl PeerStream for MemoryStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote_addr.clone()
    }

    fn reset(&mut self) {
        self.reset_local.store(true, Ordering::SeqCst);
        // Dropping the pipe wakes the other end's pending read.
        self.inner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn capture_handler(tx: mpsc::UnboundedSender<BoxedStream>) -> StreamHandler {
        Arc::new(move |stream| {
            let _ = tx.send(stream);
        })
    }

    #[tokio::test]
    async fn test_address_books_are_filled() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let b = net.add_peer();
        assert_eq!(a.address_book().addrs(&b.local_peer()), vec![b.addr().clone()]);
        assert_eq!(b.address_book().addrs(&a.local_peer()), vec![a.addr().clone()]);
    }

    #[tokio::test]
    async fn test_stream_requires_connection() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let b = net.add_peer();
        let (tx, _rx) = mpsc::unbounded_channel();
        b.set_stream_handler("/test/1", capture_handler(tx));

        let err = a.new_stream(b.local_peer(), "/test/1").await.err().unwrap();
        assert!(matches!(err, TunnelError::PeerUnreachable(_)));

        a.connect(PeerInfo { id: b.local_peer(), addrs: vec![] }).await.unwrap();
        assert!(a.is_connected(&b.local_peer()));
        assert!(b.is_connected(&a.local_peer()));
        assert!(a.new_stream(b.local_peer(), "/test/1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_protocol() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let b = net.add_peer();
        a.connect(PeerInfo { id: b.local_peer(), addrs: vec![] }).await.unwrap();
        let err = a.new_stream(b.local_peer(), "/nope").await.err().unwrap();
        assert!(matches!(err, TunnelError::StreamOpen(_)));
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let err = a
            .connect(PeerInfo { id: PeerId::random(), addrs: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_stream_metadata_and_data() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let b = net.add_peer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_stream_handler("/test/1", capture_handler(tx));
        a.connect(b.address_book().peer_info(b.local_peer())).await.unwrap();

        let mut ours = a.new_stream(b.local_peer(), "/test/1").await.unwrap();
        let mut theirs = rx.recv().await.unwrap();

        assert_eq!(ours.remote_peer(), b.local_peer());
        assert_eq!(theirs.remote_peer(), a.local_peer());
        assert_eq!(theirs.remote_addr(), a.addr().clone());
        assert_eq!(theirs.protocol(), "/test/1");

        ours.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        ours.shutdown().await.unwrap();
        let mut rest = Vec::new();
        assert_eq!(theirs.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_is_observed_as_connection_reset() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let b = net.add_peer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_stream_handler("/test/1", capture_handler(tx));
        a.connect(PeerInfo { id: b.local_peer(), addrs: vec![] }).await.unwrap();

        let mut ours = a.new_stream(b.local_peer(), "/test/1").await.unwrap();
        let mut theirs = rx.recv().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            ours.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        theirs.reset();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_removed_peer_is_unreachable() {
        let net = MemoryNetwork::new();
        let a = net.add_peer();
        let b = net.add_peer();
        a.connect(PeerInfo { id: b.local_peer(), addrs: vec![] }).await.unwrap();
        assert!(net.remove_peer(&b.local_peer()));
        assert!(!a.is_connected(&b.local_peer()));
        assert!(a
            .connect(PeerInfo { id: b.local_peer(), addrs: vec![] })
            .await
            .is_err());
    }
}
