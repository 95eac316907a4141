//! Peer discovery
//!
//! Peers swap registry directories: every discovery interval we ask each
//! connected peer for its directory, record entries we have never seen and
//! dial the ones reported ONLINE.

use crate::network::maintenance::spawn_periodic;
use crate::network::message::{Action, PeerId, RequestEnvelope, ResponseEnvelope};
use crate::network::router::{HandlerError, MessageRouter};
use crate::registry::{PeerRecord, PeerRegistry, RegistryError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Key of the directory list in a `discover_peers` response
const DIRECTORY_KEY: &str = "peersDisponibles";

/// Outcome of one discovery round
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiscoveryReport {
    /// Peers asked for their directory
    pub queried: usize,
    /// Previously unknown peers added to the registry
    pub learned: Vec<PeerId>,
    /// Learned peers we managed to connect to
    pub connected: Vec<PeerId>,
    /// Entries dropped for a bad address or shape
    pub rejected: usize,
}

pub struct PeerDiscovery {
    router: Arc<MessageRouter>,
    registry: Arc<dyn PeerRegistry>,
    request_timeout: Duration,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerDiscovery {
    pub fn new(
        router: Arc<MessageRouter>,
        registry: Arc<dyn PeerRegistry>,
        request_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            router,
            registry,
            request_timeout,
            interval,
            task: Mutex::new(None),
        }
    }

    /// The local directory as served to other peers
    pub async fn directory(&self) -> Result<Vec<PeerRecord>, RegistryError> {
        let mut records = self.registry.find_all().await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Answer `discover_peers` with the local directory
    pub async fn register_handlers(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        self.router
            .register_request_handler(Action::DiscoverPeers, move |_request: RequestEnvelope, origin: PeerId| {
                let this = this.clone();
                async move {
                    let this = this
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("discovery stopped"))?;
                    let records = this.directory().await?;
                    log::debug!("Serving {} directory entries to {}", records.len(), origin);
                    Ok::<_, HandlerError>(
                        ResponseEnvelope::success(Action::DiscoverPeers, "directory")
                            .with_data(json!({ DIRECTORY_KEY: records })),
                    )
                }
            })
            .await;
    }

    /// Spawn the periodic discovery task
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let this = self.clone();
        *task = Some(spawn_periodic("discovery", self.interval, move || {
            let this = this.clone();
            async move {
                this.discover_round().await;
            }
        }));
        log::info!("Peer discovery started (every {:?})", self.interval);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    /// Ask every connected peer for its directory and absorb the answers
    pub async fn discover_round(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for peer_id in self.router.pool().connected_peers().await {
            report.queried += 1;
            match self.fetch_directory(&peer_id).await {
                Ok(entries) => {
                    for entry in entries {
                        self.absorb(entry, &mut report).await;
                    }
                }
                Err(e) => log::warn!("Discovery with {} failed: {}", peer_id, e),
            }
        }

        if !report.learned.is_empty() {
            log::info!(
                "Discovery learned {} peer(s), connected to {}",
                report.learned.len(),
                report.connected.len()
            );
        }
        report
    }

    async fn fetch_directory(&self, peer_id: &PeerId) -> Result<Vec<Value>, String> {
        let request = RequestEnvelope::new(Action::DiscoverPeers, Value::Null);
        let data = self
            .router
            .request(peer_id, request, self.request_timeout)
            .await
            .map_err(|e| e.to_string())?
            .into_data()?;

        match data.get(DIRECTORY_KEY) {
            Some(Value::Array(entries)) => Ok(entries.clone()),
            _ => Err("directory list missing".to_string()),
        }
    }

    async fn absorb(&self, entry: Value, report: &mut DiscoveryReport) {
        let record: PeerRecord = match serde_json::from_value(entry) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Ignoring malformed directory entry: {}", e);
                report.rejected += 1;
                return;
            }
        };

        let pool = self.router.pool();
        if record.peer_id == pool.local().peer_id {
            return;
        }
        if record.ip.trim().is_empty() || record.puerto == 0 {
            log::warn!(
                "Ignoring directory entry {} with bad address {}:{}",
                record.peer_id,
                record.ip,
                record.puerto
            );
            report.rejected += 1;
            return;
        }

        match self.registry.find_by_id(&record.peer_id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                log::warn!("Registry lookup for {} failed: {}", record.peer_id, e);
                return;
            }
        }

        let peer_id = record.peer_id;
        let online = record.is_online();
        let (ip, puerto) = (record.ip.clone(), record.puerto);
        if let Err(e) = self.registry.save(record).await {
            log::warn!("Failed to record discovered peer {}: {}", peer_id, e);
            return;
        }
        log::info!("Discovered peer {} at {}:{}", peer_id, ip, puerto);
        report.learned.push(peer_id);

        if online && !pool.is_connected(&peer_id).await {
            match pool.connect(&ip, puerto).await {
                Ok(connected) => report.connected.push(connected),
                Err(e) => log::warn!("Could not reach discovered peer {}: {}", peer_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::message::PeerDescriptor;
    use crate::network::testing::{link, test_peer, TestPeer};
    use crate::registry::{MemoryPeerRegistry, PeerState};

    async fn discovery(peer: &TestPeer, registry: Arc<MemoryPeerRegistry>) -> Arc<PeerDiscovery> {
        let discovery = Arc::new(PeerDiscovery::new(
            peer.router.clone(),
            registry,
            Duration::from_secs(2),
            Duration::from_secs(60),
        ));
        discovery.register_handlers().await;
        discovery
    }

    #[tokio::test]
    async fn test_learns_and_connects_through_a_neighbour() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 1).await;
        let b = test_peer(&network, 2).await;
        let c = test_peer(&network, 3).await;

        let a_registry = Arc::new(MemoryPeerRegistry::new());
        let b_registry = Arc::new(MemoryPeerRegistry::new());
        b_registry.upsert_online(a.pool.local()).await.unwrap();
        b_registry.upsert_online(c.pool.local()).await.unwrap();

        let a_discovery = discovery(&a, a_registry.clone()).await;
        let _b_discovery = discovery(&b, b_registry).await;
        link(&a, &b).await;

        let report = a_discovery.discover_round().await;
        assert_eq!(report.queried, 1);
        assert_eq!(report.learned, vec![c.id()]);
        assert_eq!(report.connected, vec![c.id()]);
        assert!(a.pool.is_connected(&c.id()).await);
        assert!(a_registry.find_by_id(&c.id()).await.unwrap().is_some());
        // Our own entry in b's directory is not recorded
        assert!(a_registry.find_by_id(&a.id()).await.unwrap().is_none());

        // Nothing new the second time round
        let again = a_discovery.discover_round().await;
        assert!(again.learned.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_entries_and_skips_offline() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 1).await;
        let b = test_peer(&network, 2).await;

        let a_registry = Arc::new(MemoryPeerRegistry::new());
        let b_registry = Arc::new(MemoryPeerRegistry::new());
        let bad = PeerDescriptor::new(PeerId::new(), "", 4000, "nowhere");
        let zero_port = PeerDescriptor::new(PeerId::new(), "10.0.0.9", 0, "zero");
        let sleeping = PeerDescriptor::new(PeerId::new(), "10.0.0.7", 22200, "sleeping");
        b_registry.save(PeerRecord::new(&bad, PeerState::Online)).await.unwrap();
        b_registry.save(PeerRecord::new(&zero_port, PeerState::Online)).await.unwrap();
        b_registry.save(PeerRecord::new(&sleeping, PeerState::Offline)).await.unwrap();

        let a_discovery = discovery(&a, a_registry.clone()).await;
        let _b_discovery = discovery(&b, b_registry).await;
        link(&a, &b).await;

        let report = a_discovery.discover_round().await;
        assert_eq!(report.rejected, 2);
        assert_eq!(report.learned, vec![sleeping.peer_id]);
        assert!(report.connected.is_empty());
        assert_eq!(
            a_registry.find_by_id(&sleeping.peer_id).await.unwrap().unwrap().estado,
            PeerState::Offline
        );
    }

    #[tokio::test]
    async fn test_directory_response_shape() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 1).await;
        let registry = Arc::new(MemoryPeerRegistry::new());
        registry.upsert_online(a.pool.local()).await.unwrap();
        let _discovery = discovery(&a, registry).await;

        let response = a
            .router
            .handle_local(RequestEnvelope::new("DISCOVER_PEERS", Value::Null), PeerId::new())
            .await;
        let data = response.into_data().unwrap();
        let entries = data[DIRECTORY_KEY].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["estado"], "ONLINE");
        assert_eq!(entries[0]["puerto"], 1);
    }
}
