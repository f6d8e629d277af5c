//! Registry of live stream sessions.
//!
//! Entries are inserted by [`StreamSession::start`](super::StreamSession::start)
//! before any bytes move and removed by the session task itself once both
//! copy directions have stopped. Closing a session only signals the task; the
//! task performs the removal, so every session is deregistered exactly once.

use super::StreamInfo;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Registry-assigned identifier of a session, unique per registry.
pub type SessionId = u64;

/// Byte counters shared between a session task and its registry entry.
#[derive(Debug, Default)]
pub struct SessionCounters {
    /// Bytes copied from the local connection to the peer stream.
    pub bytes_out: AtomicU64,
    /// Bytes copied from the peer stream to the local connection.
    pub bytes_in: AtomicU64,
}

/// Bookkeeping for a single live session.
struct SessionEntry {
    info: Arc<StreamInfo>,
    counters: Arc<SessionCounters>,
    created_at: Instant,
    /// Sending stops the session task; the task deregisters afterwards.
    cancel_tx: mpsc::Sender<()>,
}

/// What the session task needs from its registry entry.
pub(crate) struct SessionHandle {
    pub id: SessionId,
    pub counters: Arc<SessionCounters>,
    pub cancel_rx: mpsc::Receiver<()>,
}

/// Snapshot of a session for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub protocol: String,
    pub local_peer: String,
    pub local_addr: String,
    pub remote_peer: String,
    pub remote_addr: String,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub age_secs: u64,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) async fn register(&self, info: StreamInfo) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::new(SessionCounters::default());
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        let entry = SessionEntry {
            info: Arc::new(info),
            counters: Arc::clone(&counters),
            created_at: Instant::now(),
            cancel_tx,
        };
        self.sessions.write().await.insert(id, entry);

        SessionHandle {
            id,
            counters,
            cancel_rx,
        }
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub(crate) async fn deregister(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            debug!(session = id, "session deregistered");
        }
        removed
    }

    /// Ask a session to stop. Returns `false` if no such session is live.
    pub async fn close(&self, id: SessionId) -> bool {
        let cancel_tx = self
            .sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.cancel_tx.clone());
        match cancel_tx {
            Some(tx) => {
                // A full channel means a close is already pending.
                let _ = tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Ask every live session to stop. Returns how many were signalled.
    pub async fn close_all(&self) -> usize {
        let senders: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.cancel_tx.clone())
            .collect();
        for tx in &senders {
            let _ = tx.try_send(());
        }
        senders.len()
    }

    /// List all live sessions, ordered by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                protocol: entry.info.protocol.clone(),
                local_peer: entry.info.local_peer.to_string(),
                local_addr: entry.info.local_addr.to_string(),
                remote_peer: entry.info.remote_peer.to_string(),
                remote_addr: entry.info.remote_addr.to_string(),
                bytes_out: entry.counters.bytes_out.load(Ordering::Relaxed),
                bytes_in: entry.counters.bytes_in.load(Ordering::Relaxed),
                age_secs: entry.created_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2p_tunnel_core::{parse_multiaddr, PeerId};

    fn info(protocol: &str) -> StreamInfo {
        StreamInfo {
            protocol: protocol.to_string(),
            local_peer: PeerId::random(),
            local_addr: parse_multiaddr("/ip4/127.0.0.1/tcp/80").unwrap(),
            remote_peer: PeerId::random(),
            remote_addr: parse_multiaddr("/ip4/10.0.0.2/tcp/4001").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_register_assigns_increasing_ids() {
        let registry = SessionRegistry::new();
        let a = registry.register(info("/x/a")).await;
        let b = registry.register(info("/x/b")).await;
        assert!(b.id > a.id);
        assert_eq!(registry.len().await, 2);

        let list = registry.list().await;
        assert_eq!(list[0].protocol, "/x/a");
        assert_eq!(list[1].protocol, "/x/b");
        assert_eq!(list[0].local_addr, "/ip4/127.0.0.1/tcp/80");
    }

    #[tokio::test]
    async fn test_deregister_exactly_once() {
        let registry = SessionRegistry::new();
        let handle = registry.register(info("/x/a")).await;
        assert!(registry.deregister(handle.id).await);
        assert!(!registry.deregister(handle.id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_signals_without_removing() {
        let registry = SessionRegistry::new();
        let mut handle = registry.register(info("/x/a")).await;
        assert!(registry.close(handle.id).await);
        // Second close while the first is pending must not block.
        assert!(registry.close(handle.id).await);
        assert!(registry.contains(handle.id).await);
        assert_eq!(handle.cancel_rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_close_unknown() {
        let registry = SessionRegistry::new();
        assert!(!registry.close(42).await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let mut a = registry.register(info("/x/a")).await;
        let mut b = registry.register(info("/x/b")).await;
        assert_eq!(registry.close_all().await, 2);
        assert_eq!(a.cancel_rx.recv().await, Some(()));
        assert_eq!(b.cancel_rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_counters_visible_in_list() {
        let registry = SessionRegistry::new();
        let handle = registry.register(info("/x/a")).await;
        handle.counters.bytes_out.fetch_add(10, Ordering::Relaxed);
        handle.counters.bytes_in.fetch_add(3, Ordering::Relaxed);
        let list = registry.list().await;
        assert_eq!(list[0].bytes_out, 10);
        assert_eq!(list[0].bytes_in, 3);
    }
}
