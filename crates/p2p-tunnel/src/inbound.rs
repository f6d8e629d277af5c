//! Inbound listeners: expose a local TCP service to remote peers.
//!
//! The host calls the registered handler once per inbound stream for the
//! protocol. Each call dials the configured local target and bridges the two
//! with a [`StreamSession`]. If the local dial fails the peer stream is reset
//! and nothing is registered.

use crate::manager::NodeContext;
use crate::registry::ListenerRegistry;
use crate::session::{SessionRegistry, StreamInfo, StreamSession};
use p2p_tunnel_core::{BoxedStream, Multiaddr, PeerId, SocketTarget, StreamHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Accepts peer streams for one protocol and forwards them to a local target.
pub struct InboundListener {
    protocol: String,
    target: Multiaddr,
    ctx: Arc<NodeContext>,
    registry: Weak<ListenerRegistry>,
    closed: AtomicBool,
}

impl InboundListener {
    /// Install the stream handler for `protocol` on the host.
    ///
    /// `socket` is the already-validated socket form of `target`.
    pub(crate) fn open(
        ctx: Arc<NodeContext>,
        registry: Weak<ListenerRegistry>,
        protocol: &str,
        target: Multiaddr,
        socket: SocketTarget,
    ) -> Arc<Self> {
        let bridge = Arc::new(InboundBridge {
            protocol: protocol.to_string(),
            target: target.clone(),
            socket,
            identity: ctx.identity,
            sessions: Arc::clone(&ctx.sessions),
            buffer_size: ctx.config.copy_buffer_size,
        });
        ctx.host.set_stream_handler(protocol, bridge.handler());

        info!(protocol, target = %target, "inbound listener started");

        Arc::new(Self {
            protocol: protocol.to_string(),
            target,
            ctx,
            registry,
            closed: AtomicBool::new(false),
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The local address inbound streams are forwarded to.
    pub fn target(&self) -> &Multiaddr {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove the stream handler. Returns `false` if already closed.
    pub(crate) fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.ctx.host.remove_stream_handler(&self.protocol);
        info!(protocol = %self.protocol, "inbound listener closed");
        true
    }

    /// Mark closed without removing the handler, because a newer listener
    /// has already installed its own handler for the protocol.
    pub(crate) fn mark_overwritten(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(protocol = %self.protocol, "inbound listener overwritten");
    }

    pub(crate) fn registry(&self) -> &Weak<ListenerRegistry> {
        &self.registry
    }
}

/// State captured by the stream handler.
///
/// Holds no reference to the host so the host's handler table never keeps
/// itself alive.
struct InboundBridge {
    protocol: String,
    target: Multiaddr,
    socket: SocketTarget,
    identity: PeerId,
    sessions: Arc<SessionRegistry>,
    buffer_size: usize,
}

impl InboundBridge {
    fn handler(self: &Arc<Self>) -> StreamHandler {
        let bridge = Arc::clone(self);
        Arc::new(move |stream| {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge.accept(stream).await;
            });
        })
    }

    async fn accept(&self, mut remote: BoxedStream) {
        let remote_peer = remote.remote_peer();

        let local = match self.socket.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    protocol = %self.protocol,
                    target = %self.target,
                    remote_peer = %remote_peer,
                    error = %e,
                    "local dial failed, resetting stream"
                );
                remote.reset();
                return;
            }
        };
        let _ = local.set_nodelay(true);

        let info = StreamInfo {
            protocol: self.protocol.clone(),
            local_peer: self.identity,
            local_addr: self.target.clone(),
            remote_peer,
            remote_addr: remote.remote_addr(),
        };

        StreamSession::new(info, local, remote)
            .start(Arc::clone(&self.sessions), self.buffer_size)
            .await;
    }
}
