//! In-memory peer registry

use super::{PeerRecord, PeerRegistry, RegistryError};
use crate::network::message::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Registry kept in a map; contents are lost on restart
#[derive(Default)]
pub struct MemoryPeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl MemoryPeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerRegistry for MemoryPeerRegistry {
    async fn find_by_id(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>, RegistryError> {
        Ok(self.peers.read().await.get(peer_id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<PeerRecord>, RegistryError> {
        Ok(self.peers.read().await.values().cloned().collect())
    }

    async fn save(&self, record: PeerRecord) -> Result<(), RegistryError> {
        self.peers.write().await.insert(record.peer_id, record);
        Ok(())
    }

    async fn remove(&self, peer_id: &PeerId) -> Result<bool, RegistryError> {
        Ok(self.peers.write().await.remove(peer_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::PeerDescriptor;
    use crate::registry::PeerState;
    use chrono::Utc;

    fn descriptor(port: u16) -> PeerDescriptor {
        PeerDescriptor::new(PeerId::new(), "127.0.0.1", port, format!("node-{}", port))
    }

    #[tokio::test]
    async fn test_save_and_query() {
        let registry = MemoryPeerRegistry::new();
        let a = descriptor(1);
        let b = descriptor(2);

        registry.save(PeerRecord::new(&a, PeerState::Online)).await.unwrap();
        registry.save(PeerRecord::new(&b, PeerState::Offline)).await.unwrap();

        assert_eq!(registry.find_all().await.unwrap().len(), 2);
        assert_eq!(registry.count_by_state(PeerState::Online).await.unwrap(), 1);
        assert_eq!(
            registry.find_by_state(PeerState::Offline).await.unwrap()[0].peer_id,
            b.peer_id
        );
        assert_eq!(
            registry.find_by_address("127.0.0.1", 1).await.unwrap().unwrap().peer_id,
            a.peer_id
        );
    }

    #[tokio::test]
    async fn test_heartbeat_on_missing_peer() {
        let registry = MemoryPeerRegistry::new();
        let missing = PeerId::new();

        assert!(matches!(
            registry.report_heartbeat(&missing, Utc::now()).await,
            Err(RegistryError::PeerNotFound(id)) if id == missing
        ));
        assert!(registry.mark_offline(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_last_write_wins_and_upsert() {
        let registry = MemoryPeerRegistry::new();
        let a = descriptor(1);

        let first = registry.upsert_online(&a).await.unwrap();
        registry.mark_offline(&a.peer_id).await.unwrap();
        assert_eq!(
            registry.find_by_id(&a.peer_id).await.unwrap().unwrap().estado,
            PeerState::Offline
        );

        let moved = PeerDescriptor::new(a.peer_id, "10.1.1.1", 9, "renamed");
        let second = registry.upsert_online(&moved).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.ip, "10.1.1.1");
        assert!(second.is_online());

        assert!(registry.remove(&a.peer_id).await.unwrap());
        assert!(!registry.remove(&a.peer_id).await.unwrap());
    }
}
