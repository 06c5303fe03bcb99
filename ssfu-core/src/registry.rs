//! Process-wide index of live peers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::peer::MediaPeer;
use crate::types::PeerId;

/// Maps `PeerId` to the live peer. The registry lock is the outermost lock
/// in the system and is never held across an await; iteration hands out a
/// snapshot.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<MediaPeer>>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a peer. If the id is already present the previous peer is
    /// returned so the caller can run the eviction protocol on it: the
    /// client is assumed to have reconnected without a clean close.
    pub fn insert(&self, peer: Arc<MediaPeer>) -> Option<Arc<MediaPeer>> {
        self.peers.write().insert(peer.id().clone(), peer)
    }

    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<Arc<MediaPeer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<MediaPeer>> {
        self.peers.write().remove(id)
    }

    /// Remove the entry for `id` only if it still maps to `expected`, so
    /// evicting a displaced peer cannot unseat its replacement.
    pub fn remove_entry(&self, id: &PeerId, expected: &Arc<MediaPeer>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                peers.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Consistent snapshot of every live peer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<MediaPeer>> {
        self.peers.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::engine::EngineFactory;
    use crate::transport::SignalTransport;
    use std::time::Duration;

    async fn new_peer(id: &str) -> Arc<MediaPeer> {
        let factory = EngineFactory::new(&WebRtcConfig::default()).unwrap();
        let pc = factory.new_peer_connection().await.unwrap();
        let (transport, _rx) = SignalTransport::pair(16);
        MediaPeer::new(PeerId::from(id), pc, transport, Duration::from_secs(3))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = PeerRegistry::new();
        let peer = new_peer("a").await;

        assert!(registry.insert(peer.clone()).is_none());
        assert!(registry.get(&PeerId::from("a")).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove(&PeerId::from("a"));
        assert!(registry.get(&PeerId::from("a")).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reinsert_returns_displaced_peer() {
        let registry = PeerRegistry::new();
        let old = new_peer("a").await;
        let new = new_peer("a").await;

        registry.insert(old.clone());
        let displaced = registry.insert(new.clone()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &old));
        assert!(Arc::ptr_eq(&registry.get(&PeerId::from("a")).unwrap(), &new));
    }

    #[tokio::test]
    async fn test_remove_entry_checks_identity() {
        let registry = PeerRegistry::new();
        let old = new_peer("a").await;
        let new = new_peer("a").await;

        registry.insert(old.clone());
        registry.insert(new.clone());

        // Evicting the displaced peer must not unseat its replacement.
        assert!(!registry.remove_entry(&PeerId::from("a"), &old));
        assert!(registry.get(&PeerId::from("a")).is_some());

        assert!(registry.remove_entry(&PeerId::from("a"), &new));
        assert!(registry.is_empty());
    }
}
