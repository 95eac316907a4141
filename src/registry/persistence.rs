//! File-backed peer registry
//!
//! Keeps the directory in memory and rewrites a JSON file on every change.

use super::{PeerRecord, PeerRegistry, RegistryError};
use crate::network::message::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Registry file name inside the data directory
pub const REGISTRY_FILE: &str = "peers.json";

/// Registry persisted to `<data_dir>/peers.json`
pub struct JsonPeerRegistry {
    path: PathBuf,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl JsonPeerRegistry {
    /// Open (or create) the registry in a data directory
    pub fn open(data_dir: &Path) -> Result<Self, RegistryError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(REGISTRY_FILE);

        let peers = if path.exists() {
            let file = fs::File::open(&path)?;
            let records: Vec<PeerRecord> = serde_json::from_reader(BufReader::new(file))?;
            log::info!("Loaded {} peer(s) from {}", records.len(), path.display());
            records.into_iter().map(|r| (r.peer_id, r)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            peers: RwLock::new(peers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole directory, sorted by creation time. Callers hold the
    /// write lock so snapshots reach the disk in order.
    async fn persist(&self, peers: &HashMap<PeerId, PeerRecord>) -> Result<(), RegistryError> {
        let mut records: Vec<&PeerRecord> = peers.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.peer_id.cmp(&b.peer_id)));
        let json = serde_json::to_vec_pretty(&records)?;

        // Write to temporary file first
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;

        // Atomic rename
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerRegistry for JsonPeerRegistry {
    async fn find_by_id(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>, RegistryError> {
        Ok(self.peers.read().await.get(peer_id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<PeerRecord>, RegistryError> {
        Ok(self.peers.read().await.values().cloned().collect())
    }

    async fn save(&self, record: PeerRecord) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        peers.insert(record.peer_id, record);
        self.persist(&peers).await
    }

    async fn remove(&self, peer_id: &PeerId) -> Result<bool, RegistryError> {
        let mut peers = self.peers.write().await;
        let existed = peers.remove(peer_id).is_some();
        if existed {
            self.persist(&peers).await?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::PeerDescriptor;
    use crate::registry::PeerState;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let a = PeerDescriptor::new(PeerId::new(), "10.0.0.1", 22200, "alpha");
        let b = PeerDescriptor::new(PeerId::new(), "10.0.0.2", 22200, "beta");

        {
            let registry = JsonPeerRegistry::open(dir.path()).unwrap();
            registry.upsert_online(&a).await.unwrap();
            registry.upsert_online(&b).await.unwrap();
            registry.mark_offline(&b.peer_id).await.unwrap();
        }

        let registry = JsonPeerRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.find_all().await.unwrap().len(), 2);
        assert_eq!(
            registry.find_by_id(&b.peer_id).await.unwrap().unwrap().estado,
            PeerState::Offline
        );
        assert!(registry.path().exists());
        assert!(!registry.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let dir = tempdir().unwrap();
        let a = PeerDescriptor::new(PeerId::new(), "10.0.0.1", 22200, "alpha");

        let registry = JsonPeerRegistry::open(dir.path()).unwrap();
        registry.upsert_online(&a).await.unwrap();
        assert!(registry.remove(&a.peer_id).await.unwrap());

        let reopened = JsonPeerRegistry::open(dir.path()).unwrap();
        assert!(reopened.find_all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_saves_all_persisted() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(JsonPeerRegistry::open(dir.path()).unwrap());

        let tasks: Vec<_> = (0..20u16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let peer = PeerDescriptor::new(PeerId::new(), "10.0.0.1", 22200 + i, format!("peer-{}", i));
                    registry.upsert_online(&peer).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let reopened = JsonPeerRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.find_all().await.unwrap().len(), 20);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(REGISTRY_FILE), "not json").unwrap();
        assert!(matches!(
            JsonPeerRegistry::open(dir.path()),
            Err(RegistryError::SerializationError(_))
        ));
    }
}
