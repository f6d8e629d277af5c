//! Multiaddr helpers for the conventional-socket side of a tunnel.
//!
//! Tunnel endpoints are described with multiaddrs so that local targets,
//! local bind addresses, and peer references share one notation:
//!
//! | Multiaddr                       | Meaning                               |
//! |---------------------------------|---------------------------------------|
//! | `/ip4/127.0.0.1/tcp/8080`       | IPv4 TCP socket                       |
//! | `/ip6/::1/tcp/8080`             | IPv6 TCP socket                       |
//! | `/dns4/localhost/tcp/8080`      | hostname resolved by the OS, TCP      |
//! | `/p2p/<peer-id>`                | a remote peer (outbound listener address) |
//!
//! Only stream-oriented (TCP) sockets can be tunnelled.

use crate::error::{TunnelError, TunnelResult};
use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Network kind of a dialable/bindable socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP over a hostname; the OS picks the IP family.
    Tcp,
    Tcp4,
    Tcp6,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        };
        f.write_str(s)
    }
}

impl Network {
    /// Whether a resolved address belongs to this network kind.
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

/// A socket address derived from a multiaddr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketTarget {
    pub network: Network,
    /// `host:port` string (IPv6 hosts are bracketed).
    pub host_port: String,
}

impl SocketTarget {
    /// Resolve `host_port`, keeping only addresses of [`Self::network`].
    ///
    /// `/dns4` and `/dns6` names never fall back to the other IP family.
    pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&self.host_port)
            .await?
            .filter(|addr| self.network.accepts(addr))
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", self.network, self.host_port),
            ));
        }
        debug!(addr = %self.host_port, network = %self.network, count = addrs.len(), "resolved");
        Ok(addrs)
    }

    /// Connect to the first resolved address that accepts.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.resolve().await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }

    /// Bind a listener on the first resolved address that is free.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let mut last_err = None;
        for addr in self.resolve().await? {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }
}

/// Interpret a multiaddr as a TCP socket address.
///
/// Returns [`TunnelError::UnsupportedTransport`] for anything that is not
/// `<ip4|ip6|dns|dns4|dns6>/tcp`, and [`TunnelError::InvalidAddress`] when the
/// host component is missing.
pub fn dial_args(addr: &Multiaddr) -> TunnelResult<SocketTarget> {
    let mut iter = addr.iter();

    let (network, host) = match iter.next() {
        Some(Protocol::Ip4(ip)) => (Network::Tcp4, ip.to_string()),
        Some(Protocol::Ip6(ip)) => (Network::Tcp6, format!("[{ip}]")),
        Some(Protocol::Dns(name)) => (Network::Tcp, name.to_string()),
        Some(Protocol::Dns4(name)) => (Network::Tcp4, name.to_string()),
        Some(Protocol::Dns6(name)) => (Network::Tcp6, name.to_string()),
        Some(other) => {
            return Err(TunnelError::UnsupportedTransport(format!(
                "{other} in {addr}"
            )))
        }
        None => return Err(TunnelError::InvalidAddress("empty multiaddr".to_string())),
    };

    let port = match iter.next() {
        Some(Protocol::Tcp(port)) => port,
        Some(other) => {
            return Err(TunnelError::UnsupportedTransport(format!(
                "{other} in {addr}"
            )))
        }
        None => {
            return Err(TunnelError::UnsupportedTransport(format!(
                "no transport in {addr}"
            )))
        }
    };

    if let Some(extra) = iter.next() {
        return Err(TunnelError::UnsupportedTransport(format!(
            "{extra} in {addr}"
        )));
    }

    Ok(SocketTarget {
        network,
        host_port: format!("{host}:{port}"),
    })
}

/// Convert a bound/connected socket address back into `/ip4|ip6/<ip>/tcp/<port>`.
pub fn socket_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => Protocol::Ip4(v4),
        IpAddr::V6(v6) => Protocol::Ip6(v6),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

/// The `/p2p/<peer-id>` reference address of a peer.
pub fn peer_multiaddr(peer: PeerId) -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2p(peer))
}

/// Parse a multiaddr string, mapping failures to [`TunnelError::InvalidAddress`].
pub fn parse_multiaddr(s: &str) -> TunnelResult<Multiaddr> {
    s.parse::<Multiaddr>()
        .map_err(|e| TunnelError::InvalidAddress(format!("{s}: {e}")))
}
