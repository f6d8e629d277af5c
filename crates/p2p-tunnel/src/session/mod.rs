//! Stream sessions: one live tunnel flow between a local connection and a
//! peer stream.
//!
//! A session copies bytes in both directions concurrently. The first
//! direction to finish, by EOF or by error, or an explicit close from the
//! [`SessionRegistry`], ends the session: both endpoints are shut down and
//! dropped, then the registry entry is removed exactly once.

mod registry;

pub use registry::{SessionCounters, SessionId, SessionInfo, SessionRegistry};

use p2p_tunnel_core::{BoxedStream, Multiaddr, PeerId};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Endpoint description of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub protocol: String,
    pub local_peer: PeerId,
    pub local_addr: Multiaddr,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
}

/// A tunnel flow whose two endpoints are both established.
pub struct StreamSession<L> {
    info: StreamInfo,
    local: L,
    remote: BoxedStream,
}

impl<L> StreamSession<L>
where
    L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(info: StreamInfo, local: L, remote: BoxedStream) -> Self {
        Self {
            info,
            local,
            remote,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Register the session, then spawn its copy task.
    ///
    /// Returns once the session is visible in `registry`.
    pub async fn start(self, registry: Arc<SessionRegistry>, buffer_size: usize) -> SessionId {
        let StreamSession {
            info,
            local,
            remote,
        } = self;

        info!(
            protocol = %info.protocol,
            local = %info.local_addr,
            remote_peer = %info.remote_peer,
            "session starting"
        );

        let handle = registry.register(info).await;
        let id = handle.id;

        tokio::spawn(async move {
            let ended = relay(local, remote, handle.cancel_rx, &handle.counters, buffer_size).await;
            info!(
                session = id,
                reason = %ended,
                bytes_out = handle.counters.bytes_out.load(Ordering::Relaxed),
                bytes_in = handle.counters.bytes_in.load(Ordering::Relaxed),
                "session closed"
            );
            registry.deregister(id).await;
        });

        id
    }
}

/// Why a session ended.
#[derive(Debug)]
enum Ended {
    /// The local connection reached EOF or failed.
    Local(io::Result<()>),
    /// The peer stream reached EOF or failed.
    Remote(io::Result<()>),
    Cancelled,
}

impl fmt::Display for Ended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ended::Local(Ok(())) => f.write_str("local eof"),
            Ended::Local(Err(e)) => write!(f, "local error: {e}"),
            Ended::Remote(Ok(())) => f.write_str("remote eof"),
            Ended::Remote(Err(e)) => write!(f, "remote error: {e}"),
            Ended::Cancelled => f.write_str("closed"),
        }
    }
}

/// Bidirectional relay.
///
/// Three concurrent branches:
/// - **Local→Remote**: copies the local connection into the peer stream.
/// - **Remote→Local**: copies the peer stream into the local connection.
/// - **Cancel**: stops the relay when the session is closed.
///
/// Whichever branch finishes first drops the other two, after which both
/// endpoints are shut down and released.
async fn relay<L>(
    local: L,
    remote: BoxedStream,
    mut cancel_rx: tokio::sync::mpsc::Receiver<()>,
    counters: &SessionCounters,
    buffer_size: usize,
) -> Ended
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let ended = tokio::select! {
        result = pump(&mut local_read, &mut remote_write, &counters.bytes_out, buffer_size) => {
            Ended::Local(result)
        }
        result = pump(&mut remote_read, &mut local_write, &counters.bytes_in, buffer_size) => {
            Ended::Remote(result)
        }
        _ = cancel_rx.recv() => Ended::Cancelled,
    };

    if let Err(e) = local_write.shutdown().await {
        debug!(error = %e, "local shutdown failed");
    }
    if let Err(e) = remote_write.shutdown().await {
        debug!(error = %e, "remote shutdown failed");
    }

    ended
}

/// Copy `reader` into `writer` until EOF, counting bytes as they are written.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
