//! Node-scoped tunnel manager.
//!
//! Owns the peer host handle, the address book, and both registries, and is
//! the factory for inbound and outbound listeners.
//!
//! # Protocol conflicts
//!
//! Creating a listener for a protocol that already has one is governed by
//! [`ProtocolConflict`]:
//!
//! | Policy           | Previous listener                       | New listener               |
//! |------------------|-----------------------------------------|----------------------------|
//! | `close-previous` | closed once the new one is running      | registered                 |
//! | `replace`        | left running, entry overwritten         | registered                 |
//! | `reject`         | untouched                               | fails with `ProtocolInUse` |
//!
//! A failed creation never touches the previous listener. An outbound
//! listener replacing one bound to the same address takes over its socket.
//! An inbound listener always takes over the host's handler for the
//! protocol, so its predecessor stops receiving streams under every policy.
//! Listeners left running by `replace` are still closed by
//! [`TunnelManager::shutdown`].

use crate::config::{ProtocolConflict, TunnelConfig};
use crate::inbound::InboundListener;
use crate::listener::{Direction, Listener, ListenerInfo};
use crate::outbound::{BoundSocket, OutboundListener};
use crate::registry::ListenerRegistry;
use crate::session::{SessionId, SessionInfo, SessionRegistry};
use p2p_tunnel_core::{
    dial_args, AddressBook, Multiaddr, PeerHost, PeerId, TunnelError, TunnelResult,
};
use std::sync::Arc;
use tracing::info;

/// Everything a listener needs from its node.
pub(crate) struct NodeContext {
    pub identity: PeerId,
    pub host: Arc<dyn PeerHost>,
    pub address_book: Arc<dyn AddressBook>,
    pub sessions: Arc<SessionRegistry>,
    pub config: TunnelConfig,
}

/// Creates and tracks the tunnels of one node.
///
/// Cloning is cheap and yields a handle to the same manager.
#[derive(Clone)]
pub struct TunnelManager {
    ctx: Arc<NodeContext>,
    listeners: Arc<ListenerRegistry>,
}

impl TunnelManager {
    /// Create a manager for the node behind `host`.
    pub fn new(
        host: Arc<dyn PeerHost>,
        address_book: Arc<dyn AddressBook>,
        config: TunnelConfig,
    ) -> TunnelResult<Self> {
        config.validate()?;
        let ctx = NodeContext {
            identity: host.local_peer(),
            host,
            address_book,
            sessions: Arc::new(SessionRegistry::new()),
            config,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            listeners: Arc::new(ListenerRegistry::new()),
        })
    }

    /// Identity of the local peer.
    pub fn identity(&self) -> PeerId {
        self.ctx.identity
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.ctx.config
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.ctx.sessions
    }

    /// Expose the local TCP service at `target` to remote peers under
    /// `protocol`.
    pub async fn new_inbound_listener(
        &self,
        protocol: &str,
        target: Multiaddr,
    ) -> TunnelResult<Listener> {
        let socket = dial_args(&target)?;
        self.check_conflict(protocol).await?;

        let inbound = InboundListener::open(
            Arc::clone(&self.ctx),
            Arc::downgrade(&self.listeners),
            protocol,
            target,
            socket,
        );
        let listener = Listener::Inbound(inbound);
        self.install(&listener).await;
        Ok(listener)
    }

    /// Bind `bind_addr` locally and forward every connection to `peer`'s
    /// inbound listener for `protocol`.
    ///
    /// The previous listener for `protocol` is only retired once the new
    /// socket is bound; a failed bind leaves it untouched.
    pub async fn new_outbound_listener(
        &self,
        protocol: &str,
        peer: PeerId,
        bind_addr: Multiaddr,
    ) -> TunnelResult<Listener> {
        dial_args(&bind_addr)?;
        self.check_conflict(protocol).await?;

        let socket = match self.take_over_socket(protocol, &bind_addr).await {
            Some(socket) => socket,
            None => OutboundListener::bind(protocol, &bind_addr).await?,
        };
        let outbound = OutboundListener::start(
            Arc::clone(&self.ctx),
            Arc::downgrade(&self.listeners),
            protocol,
            peer,
            socket,
        );
        let listener = Listener::Outbound(outbound);
        self.install(&listener).await;
        Ok(listener)
    }

    async fn check_conflict(&self, protocol: &str) -> TunnelResult<()> {
        if self.ctx.config.on_conflict == ProtocolConflict::Reject
            && self.listeners.contains(protocol).await
        {
            return Err(TunnelError::ProtocolInUse(protocol.to_string()));
        }
        Ok(())
    }

    /// Under `close-previous`, reuse the socket of an outbound predecessor
    /// bound to exactly `bind_addr` rather than racing it for the port.
    async fn take_over_socket(&self, protocol: &str, bind_addr: &Multiaddr) -> Option<BoundSocket> {
        if self.ctx.config.on_conflict != ProtocolConflict::ClosePrevious {
            return None;
        }
        match self.listeners.get(protocol).await? {
            Listener::Outbound(previous) if previous.bound_addr() == bind_addr => {
                previous.take_socket().await
            }
            _ => None,
        }
    }

    /// Register `listener` and retire whatever entry it displaces.
    async fn install(&self, listener: &Listener) {
        let Some(displaced) = self.listeners.register(listener.clone()).await else {
            return;
        };
        let policy = self.ctx.config.on_conflict;

        // The new inbound handler has already replaced the old one on the host.
        if let Listener::Inbound(old) = &displaced {
            if listener.direction() == Direction::Inbound {
                old.mark_overwritten();
                return;
            }
        }

        if policy == ProtocolConflict::Replace {
            self.listeners.retain_displaced(displaced).await;
        } else {
            info!(
                protocol = listener.protocol(),
                direction = %displaced.direction(),
                "closing previous listener"
            );
            displaced.release().await;
        }
    }

    pub async fn listener(&self, protocol: &str) -> Option<Listener> {
        self.listeners.get(protocol).await
    }

    pub async fn list_listeners(&self) -> Vec<ListenerInfo> {
        self.listeners.list().await
    }

    /// Close the listener registered for `protocol`.
    pub async fn close_listener(&self, protocol: &str) -> TunnelResult<()> {
        let listener = self
            .listeners
            .get(protocol)
            .await
            .ok_or_else(|| TunnelError::ListenerNotFound(protocol.to_string()))?;
        listener.close().await;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.ctx.sessions.list().await
    }

    /// Stop one session. It is deregistered once its copy task has wound down.
    pub async fn close_session(&self, id: SessionId) -> TunnelResult<()> {
        if self.ctx.sessions.close(id).await {
            Ok(())
        } else {
            Err(TunnelError::SessionNotFound(id))
        }
    }

    /// Stop every session. Returns how many were signalled.
    pub async fn close_all_sessions(&self) -> usize {
        self.ctx.sessions.close_all().await
    }

    /// Close every listener and every session.
    pub async fn shutdown(&self) {
        let listeners = self.listeners.drain().await;
        let count = listeners.len();
        for listener in listeners {
            listener.release().await;
        }
        let sessions = self.close_all_sessions().await;
        info!(listeners = count, sessions, "tunnel manager shut down");
    }
}
