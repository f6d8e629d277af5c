//! The polymorphic tunnel listener.

use crate::inbound::InboundListener;
use crate::outbound::OutboundListener;
use crate::registry::ListenerRegistry;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};

/// Which way a listener forwards traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Peer streams in, local connections out.
    Inbound,
    /// Local connections in, peer streams out.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.pad("inbound"),
            Direction::Outbound => f.pad("outbound"),
        }
    }
}

/// Snapshot of a listener for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    pub protocol: String,
    pub address: String,
    pub direction: Direction,
}

/// An active tunnel listener.
///
/// Cloning is cheap and yields a handle to the same listener.
#[derive(Clone)]
pub enum Listener {
    Inbound(Arc<InboundListener>),
    Outbound(Arc<OutboundListener>),
}

impl Listener {
    pub fn protocol(&self) -> &str {
        match self {
            Listener::Inbound(l) => l.protocol(),
            Listener::Outbound(l) => l.protocol(),
        }
    }

    /// Where the listener forwards to: the local target for inbound
    /// listeners, the `/p2p/<peer-id>` reference for outbound ones.
    pub fn address(&self) -> String {
        match self {
            Listener::Inbound(l) => l.target().to_string(),
            Listener::Outbound(l) => l.address().to_string(),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Listener::Inbound(_) => Direction::Inbound,
            Listener::Outbound(_) => Direction::Outbound,
        }
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            protocol: self.protocol().to_string(),
            address: self.address(),
            direction: self.direction(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Listener::Inbound(l) => l.is_closed(),
            Listener::Outbound(l) => l.is_closed(),
        }
    }

    /// Whether both handles refer to the same listener.
    pub fn same_as(&self, other: &Listener) -> bool {
        match (self, other) {
            (Listener::Inbound(a), Listener::Inbound(b)) => Arc::ptr_eq(a, b),
            (Listener::Outbound(a), Listener::Outbound(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Stop accepting new connections and drop the registry entry.
    ///
    /// Sessions already started keep running. Closing twice, or closing a
    /// listener that has been displaced by another one for the same
    /// protocol, is a no-op and never touches the successor.
    pub async fn close(&self) {
        self.release().await;
        if let Some(registry) = self.registry().upgrade() {
            registry.deregister_if(self).await;
        }
    }

    /// Release the underlying handler or socket without touching the
    /// registry. Returns `false` if it was already released.
    pub(crate) async fn release(&self) -> bool {
        match self {
            Listener::Inbound(l) => l.release(),
            Listener::Outbound(l) => l.release().await,
        }
    }

    fn registry(&self) -> &Weak<ListenerRegistry> {
        match self {
            Listener::Inbound(l) => l.registry(),
            Listener::Outbound(l) => l.registry(),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("protocol", &self.protocol())
            .field("address", &self.address())
            .field("direction", &self.direction())
            .field("closed", &self.is_closed())
            .finish()
    }
}
