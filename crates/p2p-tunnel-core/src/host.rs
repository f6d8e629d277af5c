//! Peer-to-peer host capability consumed by the tunnel layer.
//!
//! The tunnel layer never dials peers, negotiates protocols, or multiplexes
//! streams itself. It relies on a [`PeerHost`] that can connect to a peer,
//! open a protocol-tagged stream to it, and dispatch inbound streams for a
//! protocol to a registered [`StreamHandler`].

use crate::error::TunnelResult;
use futures_util::future::BoxFuture;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};

/// A multiplexed, protocol-tagged byte stream to a remote peer.
///
/// Graceful close is `AsyncWrite::poll_shutdown` (or dropping the stream);
/// [`reset`](PeerStream::reset) aborts it so the remote side observes
/// `ErrorKind::ConnectionReset` instead of a clean EOF.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Protocol name this stream was opened for.
    fn protocol(&self) -> &str;

    /// Identity of the peer at the other end.
    fn remote_peer(&self) -> PeerId;

    /// Observed network address of the remote peer's connection.
    fn remote_addr(&self) -> Multiaddr;

    /// Abort the stream in both directions.
    fn reset(&mut self);
}

pub type BoxedStream = Box<dyn PeerStream>;

/// Callback invoked once per inbound stream for a registered protocol.
///
/// Called from the host's dispatch context; implementations should hand the
/// stream to a spawned task rather than block.
pub type StreamHandler = Arc<dyn Fn(BoxedStream) + Send + Sync>;

/// A peer identity together with the addresses it may be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// The peer-to-peer host: dialing, stream opening, and protocol dispatch.
pub trait PeerHost: Send + Sync {
    /// Identity of this host.
    fn local_peer(&self) -> PeerId;

    /// Install `handler` for inbound streams on `protocol`, replacing any
    /// handler previously installed for it.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    /// Remove the handler for `protocol`, if any.
    fn remove_stream_handler(&self, protocol: &str);

    /// Ensure a connection to `peer` exists. A no-op when already connected.
    fn connect(&self, peer: PeerInfo) -> BoxFuture<'_, TunnelResult<()>>;

    /// Open a new stream to `peer` for `protocol` over an existing connection.
    fn new_stream<'a>(
        &'a self,
        peer: PeerId,
        protocol: &'a str,
    ) -> BoxFuture<'a, TunnelResult<BoxedStream>>;
}

/// Known addresses of remote peers.
pub trait AddressBook: Send + Sync {
    /// Record additional addresses for `peer`. Duplicates are ignored.
    fn add_addrs(&self, peer: PeerId, addrs: &[Multiaddr]);

    /// Addresses known for `peer` (empty when unknown).
    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// All peers with at least one known address.
    fn peers(&self) -> Vec<PeerId>;

    /// Convenience: build a [`PeerInfo`] for `peer` from the known addresses.
    fn peer_info(&self, peer: PeerId) -> PeerInfo {
        PeerInfo {
            id: peer,
            addrs: self.addrs(&peer),
        }
    }
}

/// Lock-guarded in-memory [`AddressBook`].
#[derive(Default)]
pub struct MemoryAddressBook {
    entries: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl MemoryAddressBook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressBook for MemoryAddressBook {
    fn add_addrs(&self, peer: PeerId, addrs: &[Multiaddr]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let known = entries.entry(peer).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, addrs)| !addrs.is_empty())
            .map(|(peer, _)| *peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_book_dedup() {
        let book = MemoryAddressBook::new();
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        book.add_addrs(peer, &[addr.clone(), addr.clone()]);
        book.add_addrs(peer, &[addr.clone()]);
        assert_eq!(book.addrs(&peer), vec![addr]);
        assert_eq!(book.peers(), vec![peer]);
    }

    #[test]
    fn test_unknown_peer_info() {
        let book = MemoryAddressBook::new();
        let peer = PeerId::random();
        let info = book.peer_info(peer);
        assert_eq!(info.id, peer);
        assert!(info.addrs.is_empty());
        assert!(book.peers().is_empty());
    }
}
