//! Registry of active listeners, one per protocol name.

use crate::listener::{Listener, ListenerInfo};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Active listeners keyed by protocol name.
///
/// The registry only tracks listeners; it never opens or closes their
/// sockets or handlers. Listeners silently displaced from their protocol
/// entry stay reachable here until closed, so a node shutdown can still
/// release them.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Listener>>,
    displaced: RwLock<Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `listener` under its protocol name, returning the entry it
    /// displaced, if any.
    pub async fn register(&self, listener: Listener) -> Option<Listener> {
        let protocol = listener.protocol().to_string();
        let displaced = self
            .listeners
            .write()
            .await
            .insert(protocol.clone(), listener);
        debug!(protocol = %protocol, displaced = displaced.is_some(), "listener registered");
        displaced
    }

    pub async fn get(&self, protocol: &str) -> Option<Listener> {
        self.listeners.read().await.get(protocol).cloned()
    }

    pub async fn contains(&self, protocol: &str) -> bool {
        self.listeners.read().await.contains_key(protocol)
    }

    /// Remove whatever listener is registered for `protocol`.
    pub async fn deregister(&self, protocol: &str) -> Option<Listener> {
        let removed = self.listeners.write().await.remove(protocol);
        if removed.is_some() {
            debug!(protocol, "listener deregistered");
        }
        removed
    }

    /// Remove the entry for `listener`'s protocol only if it is `listener`
    /// itself.
    pub async fn deregister_if(&self, listener: &Listener) -> bool {
        let mut listeners = self.listeners.write().await;
        match listeners.get(listener.protocol()) {
            Some(current) if current.same_as(listener) => {
                listeners.remove(listener.protocol());
                debug!(protocol = listener.protocol(), "listener deregistered");
                true
            }
            _ => false,
        }
    }

    /// Keep a listener that lost its entry but is still running.
    pub(crate) async fn retain_displaced(&self, listener: Listener) {
        let mut displaced = self.displaced.write().await;
        displaced.retain(|l| !l.is_closed());
        debug!(protocol = listener.protocol(), "displaced listener retained");
        displaced.push(listener);
    }

    /// Displaced listeners that are still running.
    pub async fn displaced(&self) -> Vec<Listener> {
        self.displaced
            .read()
            .await
            .iter()
            .filter(|l| !l.is_closed())
            .cloned()
            .collect()
    }

    /// Remove and return every listener, displaced ones included.
    pub async fn drain(&self) -> Vec<Listener> {
        let mut drained: Vec<Listener> =
            self.listeners.write().await.drain().map(|(_, l)| l).collect();
        drained.extend(self.displaced.write().await.drain(..));
        drained
    }

    /// Snapshot of all listeners, ordered by protocol name.
    pub async fn list(&self) -> Vec<ListenerInfo> {
        let mut list: Vec<ListenerInfo> = self
            .listeners
            .read()
            .await
            .values()
            .map(Listener::info)
            .collect();
        list.sort_by(|a, b| a.protocol.cmp(&b.protocol));
        list
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ProtocolConflict, TunnelConfig};
    use crate::manager::TunnelManager;
    use p2p_tunnel_core::{parse_multiaddr, MemoryNetwork, PeerId};

    fn manager(on_conflict: ProtocolConflict) -> TunnelManager {
        let net = MemoryNetwork::new();
        let host = net.add_peer();
        let config = TunnelConfig {
            on_conflict,
            ..TunnelConfig::default()
        };
        TunnelManager::new(host.clone(), host.address_book(), config).unwrap()
    }

    #[tokio::test]
    async fn test_list_sorted_by_protocol() {
        let mgr = manager(ProtocolConflict::ClosePrevious);
        for proto in ["/x/web", "/x/api", "/x/ssh"] {
            mgr.new_inbound_listener(proto, parse_multiaddr("/ip4/127.0.0.1/tcp/80").unwrap())
                .await
                .unwrap();
        }
        let protocols: Vec<_> = mgr
            .listeners()
            .list()
            .await
            .into_iter()
            .map(|l| l.protocol)
            .collect();
        assert_eq!(protocols, ["/x/api", "/x/ssh", "/x/web"]);
    }

    #[tokio::test]
    async fn test_deregister_if_only_matches_same_listener() {
        let mgr = manager(ProtocolConflict::Replace);
        let any = || parse_multiaddr("/ip4/127.0.0.1/tcp/0").unwrap();
        let old = mgr
            .new_outbound_listener("/x/web", PeerId::random(), any())
            .await
            .unwrap();
        let new = mgr
            .new_outbound_listener("/x/web", PeerId::random(), any())
            .await
            .unwrap();

        let registry = mgr.listeners();
        assert_eq!(registry.displaced().await.len(), 1);
        assert!(registry.displaced().await[0].same_as(&old));
        assert!(!registry.deregister_if(&old).await);
        assert!(registry.contains("/x/web").await);
        assert!(registry.deregister_if(&new).await);
        assert!(registry.is_empty().await);

        old.close().await;
        new.close().await;
        assert!(registry.displaced().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let mgr = manager(ProtocolConflict::ClosePrevious);
        let target = parse_multiaddr("/ip4/127.0.0.1/tcp/80").unwrap();
        mgr.new_inbound_listener("/x/a", target.clone()).await.unwrap();
        mgr.new_inbound_listener("/x/b", target).await.unwrap();

        let drained = mgr.listeners().drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(mgr.listeners().len().await, 0);
        assert!(mgr.listeners().deregister("/x/a").await.is_none());
    }
}
