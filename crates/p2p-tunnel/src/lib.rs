//! p2p-tunnel: application-protocol tunnels over a peer-to-peer host.
//!
//! An inbound listener exposes a local TCP service to remote peers under a
//! protocol name. An outbound listener binds a local TCP port and forwards
//! each connection to a chosen peer's inbound listener. Every bridged
//! connection is a [`StreamSession`] tracked in the [`SessionRegistry`];
//! listeners are tracked per protocol in the [`ListenerRegistry`]. The
//! [`TunnelManager`] ties them to one node.

pub mod config;
pub mod inbound;
pub mod listener;
pub mod manager;
pub mod outbound;
pub mod registry;
pub mod session;

pub use config::{ProtocolConflict, TunnelConfig};
pub use inbound::InboundListener;
pub use listener::{Direction, Listener, ListenerInfo};
pub use manager::TunnelManager;
pub use outbound::OutboundListener;
pub use registry::ListenerRegistry;
pub use session::{SessionCounters, SessionId, SessionInfo, SessionRegistry, StreamInfo, StreamSession};
