//! Outbound listeners: expose a remote peer's service as a local TCP port.
//!
//! Binds a TCP listener and runs an accept loop in its own task. Every
//! accepted connection is handled in a further task that connects to the
//! target peer (bounded by the configured dial timeout), opens a stream for
//! the protocol, and bridges the two with a [`StreamSession`]. A failed dial
//! closes only that connection.
//!
//! The accept loop ends when the listener is closed, when its last handle is
//! dropped, or when `accept` fails; callers cannot tell these apart.

use crate::manager::NodeContext;
use crate::registry::ListenerRegistry;
use crate::session::{StreamInfo, StreamSession};
use p2p_tunnel_core::{
    dial_args, peer_multiaddr, socket_multiaddr, BoxedStream, Multiaddr, PeerId, TunnelError,
    TunnelResult,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepts local TCP connections and forwards them to one remote peer.
pub struct OutboundListener {
    protocol: String,
    peer: PeerId,
    /// Actual bound address (port 0 resolved).
    bound: Multiaddr,
    registry: Weak<ListenerRegistry>,
    closed: AtomicBool,
    /// Sending (or dropping) stops the accept loop.
    cancel_tx: mpsc::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<Option<TcpListener>>>>,
}

/// A bound local socket not yet serving any listener.
pub(crate) struct BoundSocket {
    listener: TcpListener,
    /// Actual bound address (port 0 resolved).
    addr: Multiaddr,
}

impl OutboundListener {
    /// Bind `bind_addr`. Nothing is started until [`Self::start`].
    pub(crate) async fn bind(protocol: &str, bind_addr: &Multiaddr) -> TunnelResult<BoundSocket> {
        let socket = dial_args(bind_addr)?;
        let listener = socket.bind().await.map_err(|e| {
            warn!(protocol, addr = %bind_addr, error = %e, "outbound bind failed");
            TunnelError::Io(e)
        })?;
        let addr = socket_multiaddr(listener.local_addr()?);
        Ok(BoundSocket { listener, addr })
    }

    /// Start the accept loop on `socket`.
    pub(crate) fn start(
        ctx: Arc<NodeContext>,
        registry: Weak<ListenerRegistry>,
        protocol: &str,
        peer: PeerId,
        socket: BoundSocket,
    ) -> Arc<Self> {
        let BoundSocket { listener, addr: bound } = socket;

        let dialer = Arc::new(PeerDialer {
            protocol: protocol.to_string(),
            peer,
            bound: bound.clone(),
            ctx,
        });

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(accept_loop(listener, cancel_rx, dialer));

        info!(protocol, addr = %bound, peer = %peer, "outbound listener started");

        Arc::new(Self {
            protocol: protocol.to_string(),
            peer,
            bound,
            registry,
            closed: AtomicBool::new(false),
            cancel_tx,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The peer connections are forwarded to.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// `/p2p/<peer-id>` reference of the target peer.
    pub fn address(&self) -> Multiaddr {
        peer_multiaddr(self.peer)
    }

    /// The local address the listener is bound to.
    pub fn bound_addr(&self) -> &Multiaddr {
        &self.bound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the accept loop and wait until the socket is released.
    /// Returns `false` if already closed.
    pub(crate) async fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        drop(self.stop_accepting().await);
        info!(protocol = %self.protocol, addr = %self.bound, "outbound listener closed");
        true
    }

    /// Stop the accept loop and hand its socket to a successor instead of
    /// closing it. `None` if already closed or the loop has already ended.
    pub(crate) async fn take_socket(&self) -> Option<BoundSocket> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let listener = self.stop_accepting().await?;
        info!(protocol = %self.protocol, addr = %self.bound, "outbound listener handed over its socket");
        Some(BoundSocket {
            listener,
            addr: self.bound.clone(),
        })
    }

    async fn stop_accepting(&self) -> Option<TcpListener> {
        // A full channel means the loop is already being cancelled.
        let _ = self.cancel_tx.try_send(());
        let task = self.accept_task.lock().await.take()?;
        task.await.ok().flatten()
    }

    pub(crate) fn registry(&self) -> &Weak<ListenerRegistry> {
        &self.registry
    }
}

/// Accept loop for an outbound listener.
///
/// Returns the socket when cancelled (or when every listener handle is
/// dropped), `None` when `accept` failed.
async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    dialer: Arc<PeerDialer>,
) -> Option<TcpListener> {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(protocol = %dialer.protocol, "accept loop cancelled");
                return Some(listener);
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, from)) => {
                        debug!(protocol = %dialer.protocol, from = %from, "local connection accepted");
                        let dialer = Arc::clone(&dialer);
                        tokio::spawn(async move {
                            dialer.bridge(stream, from).await;
                        });
                    }
                    Err(e) => {
                        warn!(protocol = %dialer.protocol, error = %e, "accept failed, outbound listener stopped");
                        return None;
                    }
                }
            }
        }
    }
}

/// Per-connection work of an outbound listener.
struct PeerDialer {
    protocol: String,
    peer: PeerId,
    bound: Multiaddr,
    ctx: Arc<NodeContext>,
}

impl PeerDialer {
    async fn bridge(&self, local: TcpStream, from: SocketAddr) {
        let remote = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    protocol = %self.protocol,
                    peer = %self.peer,
                    from = %from,
                    error = %e,
                    "peer dial failed, dropping connection"
                );
                return;
            }
        };
        let _ = local.set_nodelay(true);

        let info = StreamInfo {
            protocol: self.protocol.clone(),
            local_peer: self.ctx.identity,
            local_addr: self.bound.clone(),
            remote_peer: remote.remote_peer(),
            remote_addr: remote.remote_addr(),
        };

        StreamSession::new(info, local, remote)
            .start(Arc::clone(&self.ctx.sessions), self.ctx.config.copy_buffer_size)
            .await;
    }

    /// Connect to the peer if needed, then open a stream for the protocol.
    async fn dial(&self) -> TunnelResult<BoxedStream> {
        let timeout = self.ctx.config.dial_timeout();
        let peer_info = self.ctx.address_book.peer_info(self.peer);

        tokio::time::timeout(timeout, self.ctx.host.connect(peer_info))
            .await
            .map_err(|_| TunnelError::Timeout(timeout))??;

        self.ctx.host.new_stream(self.peer, &self.protocol).await
    }
}
