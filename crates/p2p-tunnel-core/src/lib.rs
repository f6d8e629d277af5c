//! p2p-tunnel-core: shared types for the tunnel layer.
//!
//! Provides the error taxonomy, the peer-to-peer host capability traits the
//! tunnel layer is written against, multiaddr helpers for the socket side,
//! and an in-memory peer network implementing the host traits.

pub mod addr;
pub mod error;
pub mod host;
pub mod memory;

// Re-export commonly used items at crate root.
pub use addr::{dial_args, parse_multiaddr, peer_multiaddr, socket_multiaddr, Network, SocketTarget};
pub use error::{TunnelError, TunnelResult};
pub use host::{AddressBook, BoxedStream, MemoryAddressBook, PeerHost, PeerInfo, PeerStream, StreamHandler};
pub use memory::{MemoryHost, MemoryNetwork, MemoryStream};

pub use libp2p_identity::PeerId;
pub use multiaddr::Multiaddr;
