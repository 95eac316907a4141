//! Overlay node
//!
//! Wires the transport, connection pool, router, maintenance scheduler,
//! discovery, routing helper and sync engine into one running peer.

use crate::config::{ConfigError, OverlayConfig};
use crate::events::{EventBus, OverlayEvent};
use crate::network::discovery::PeerDiscovery;
use crate::network::maintenance::{MaintenanceConfig, MaintenanceScheduler};
use crate::network::message::{Action, HeartbeatPayload, PeerDescriptor, PeerId, RequestEnvelope, ResponseEnvelope};
use crate::network::pool::{ConnectionPool, PeerError, PoolConfig};
use crate::network::router::{HandlerError, MessageRouter};
use crate::network::transport::{TcpTransport, Transport, TransportError, TransportEvent};
use crate::registry::{JsonPeerRegistry, MemoryPeerRegistry, PeerRegistry, PeerState, RegistryError};
use crate::routing::{EntityUserDirectory, RoutingHelper, UserDirectory};
use crate::sync::{
    AttachmentStore, EntityStore, FsAttachmentStore, MemoryAttachmentStore, MemoryEntityStore, SyncConfig,
    SyncEngine,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Depth of the transport event queue
const TRANSPORT_QUEUE_DEPTH: usize = 1024;

/// Attachment directory inside the data directory
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Node already started")]
    AlreadyStarted,
}

/// Storage a node runs against
#[derive(Clone)]
pub struct NodeServices {
    pub registry: Arc<dyn PeerRegistry>,
    pub store: Arc<dyn EntityStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub users: Arc<dyn UserDirectory>,
}

impl NodeServices {
    /// Everything in memory
    pub fn in_memory() -> Self {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryEntityStore::new());
        Self {
            registry: Arc::new(MemoryPeerRegistry::new()),
            users: Arc::new(EntityUserDirectory::new(store.clone())),
            store,
            attachments: Arc::new(MemoryAttachmentStore::new()),
        }
    }

    /// Peer registry and attachments under `data_dir`; entities in memory
    pub fn persistent(data_dir: &Path) -> Result<Self, NodeError> {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryEntityStore::new());
        Ok(Self {
            registry: Arc::new(JsonPeerRegistry::open(data_dir)?),
            users: Arc::new(EntityUserDirectory::new(store.clone())),
            store,
            attachments: Arc::new(FsAttachmentStore::new(data_dir.join(ATTACHMENTS_DIR))),
        })
    }
}

/// Snapshot of a node
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub peer: PeerDescriptor,
    pub listening: Option<SocketAddr>,
    /// Peers with at least one live link
    pub connected_peers: usize,
    pub connections: usize,
    /// Registry entries, ONLINE or not
    pub known_peers: usize,
    pub online_peers: usize,
    pub pending_requests: usize,
}

/// A running overlay peer
pub struct Node {
    config: OverlayConfig,
    events: Arc<EventBus>,
    registry: Arc<dyn PeerRegistry>,
    transport: Arc<dyn Transport>,
    transport_events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    pool: Arc<ConnectionPool>,
    router: Arc<MessageRouter>,
    maintenance: Arc<MaintenanceScheduler>,
    discovery: Arc<PeerDiscovery>,
    routing: Arc<RoutingHelper>,
    sync: Arc<SyncEngine>,
    listening: Mutex<Option<SocketAddr>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build a node over an arbitrary transport. `transport_events` must be
    /// the receiving end of the channel the transport reports into.
    pub async fn new(
        config: OverlayConfig,
        services: NodeServices,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let local = local_identity(&config, services.registry.as_ref()).await?;
        log::info!("Local peer {} ({}) at {}", local.peer_id, local.nombre_servidor, local.address());

        let events = Arc::new(EventBus::new());
        let pool = Arc::new(ConnectionPool::new(
            local,
            transport.clone(),
            PoolConfig::from(&config),
            events.clone(),
        ));
        let router = Arc::new(MessageRouter::new(pool.clone()));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            pool.clone(),
            services.registry.clone(),
            events.clone(),
            MaintenanceConfig::from(&config),
        ));
        let discovery = Arc::new(PeerDiscovery::new(
            router.clone(),
            services.registry.clone(),
            config.client_timeout(),
            config.discovery_interval(),
        ));
        let routing = Arc::new(RoutingHelper::new(
            router.clone(),
            services.users.clone(),
            config.client_timeout(),
        ));
        let sync = Arc::new(SyncEngine::new(
            router.clone(),
            services.store.clone(),
            services.attachments.clone(),
            events.clone(),
            SyncConfig::from(&config),
        ));

        let node = Arc::new(Self {
            config,
            events,
            registry: services.registry,
            transport,
            transport_events: Mutex::new(Some(transport_events)),
            pool,
            router,
            maintenance,
            discovery,
            routing,
            sync,
            listening: Mutex::new(None),
            pump: Mutex::new(None),
        });

        node.register_handlers().await;
        node.subscribe();
        Ok(node)
    }

    /// Node over TCP
    pub async fn tcp(config: OverlayConfig, services: NodeServices) -> Result<Arc<Self>, NodeError> {
        let (tx, rx) = mpsc::channel(TRANSPORT_QUEUE_DEPTH);
        Self::new(config, services, Arc::new(TcpTransport::new(tx)), rx).await
    }

    async fn register_handlers(&self) {
        let registry = self.registry.clone();
        self.router
            .register_request_handler(Action::Heartbeat, move |request: RequestEnvelope, origin: PeerId| {
                let registry = registry.clone();
                async move {
                    let at = serde_json::from_value::<HeartbeatPayload>(request.payload)
                        .map(|h| h.timestamp)
                        .unwrap_or_else(|_| Utc::now());
                    if let Err(e) = registry.report_heartbeat(&origin, at).await {
                        log::debug!("Heartbeat from {} not recorded: {}", origin, e);
                    }
                    Ok::<_, HandlerError>(ResponseEnvelope::success(Action::Heartbeat, "alive"))
                }
            })
            .await;

        self.discovery.register_handlers().await;
        self.routing.register_handlers().await;
        self.sync.register_handlers().await;
    }

    /// Record new peers and pull their data; fail their pending requests
    /// when they go away
    fn subscribe(&self) {
        let registry = self.registry.clone();
        let sync = Arc::downgrade(&self.sync);
        let router = Arc::downgrade(&self.router);

        self.events.subscribe(move |event| match event {
            OverlayEvent::PeerConnected { peer, addr, direction } => {
                log::info!("Peer {} ({}) connected {:?} via {}", peer.peer_id, peer.nombre_servidor, direction, addr);
                let registry = registry.clone();
                let sync = sync.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.upsert_online(&peer).await {
                        log::warn!("Failed to record peer {}: {}", peer.peer_id, e);
                    }
                    if let Some(sync) = sync.upgrade() {
                        sync.sync_all(peer.peer_id).await;
                    }
                });
            }
            OverlayEvent::PeerDisconnected { peer_id, reason } => {
                log::info!("Peer {} disconnected: {}", peer_id, reason);
                let router = router.clone();
                let peer_id = *peer_id;
                tokio::spawn(async move {
                    if let Some(router) = router.upgrade() {
                        router.cancel_peer(&peer_id).await;
                    }
                });
            }
            _ => {}
        });
    }

    /// Listen, start the periodic tasks and dial the bootstrap peers
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let rx = self
            .transport_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(NodeError::AlreadyStarted)?;
        let bootstrap = self.config.bootstrap_addresses()?;

        let addr = self.transport.listen(self.config.port).await?;
        *self.listening.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(spawn_event_pump(self.router.clone(), rx));
        log::info!("Node {} listening on {}", self.config.name, addr);

        self.maintenance.start();
        self.discovery.start();
        self.sync.start();

        for (host, port) in bootstrap {
            match self.pool.connect(&host, port).await {
                Ok(peer_id) => log::info!("Bootstrap peer {}:{} is {}", host, port, peer_id),
                Err(e) => log::warn!("Bootstrap peer {}:{} unreachable: {}", host, port, e),
            }
        }

        Ok(addr)
    }

    /// Stop periodic work, drop every link and mark ourselves OFFLINE
    pub async fn shutdown(&self) {
        log::info!("Node shutting down...");
        self.maintenance.stop();
        self.discovery.stop();
        self.sync.stop();
        self.pool.disconnect_all().await;
        self.transport.shutdown().await;

        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        if let Err(e) = self.registry.mark_offline(&self.local().peer_id).await {
            log::warn!("Failed to mark local peer offline: {}", e);
        }
    }

    /// Pull from every connected peer now instead of waiting for the next
    /// anti-entropy round. Returns the number of peers synced.
    pub async fn force_sync(&self) -> usize {
        log::info!("Forcing sync with connected peers");
        self.sync.sync_connected().await
    }

    /// Dial a peer directly
    pub async fn connect(&self, host: &str, port: u16) -> Result<PeerId, PeerError> {
        self.pool.connect(host, port).await
    }

    pub async fn status(&self) -> NodeStatus {
        let records = match self.registry.find_all().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Registry unavailable: {}", e);
                Vec::new()
            }
        };

        NodeStatus {
            peer: self.local().clone(),
            listening: *self.listening.lock().unwrap_or_else(|e| e.into_inner()),
            connected_peers: self.pool.connected_peers().await.len(),
            connections: self.pool.connection_count().await,
            known_peers: records.len(),
            online_peers: records.iter().filter(|r| r.estado == PeerState::Online).count(),
            pending_requests: self.router.pending_count().await,
        }
    }

    pub fn local(&self) -> &PeerDescriptor {
        self.pool.local()
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<dyn PeerRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceScheduler> {
        &self.maintenance
    }

    pub fn discovery(&self) -> &Arc<PeerDiscovery> {
        &self.discovery
    }

    pub fn routing(&self) -> &Arc<RoutingHelper> {
        &self.routing
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }
}

/// Find ourselves in the registry by advertised address, or mint a new
/// identity, and record it as ONLINE
async fn local_identity(config: &OverlayConfig, registry: &dyn PeerRegistry) -> Result<PeerDescriptor, RegistryError> {
    let peer_id = match registry.find_by_address(&config.advertise_host, config.port).await? {
        Some(existing) => {
            log::info!("Reusing peer id {} from registry", existing.peer_id);
            existing.peer_id
        }
        None => PeerId::new(),
    };

    let local = PeerDescriptor::new(peer_id, config.advertise_host.clone(), config.port, config.name.clone());
    registry.upsert_online(&local).await?;
    Ok(local)
}

/// Feed transport events into the pool, and application frames into the
/// router. Each frame is dispatched on its own task.
pub(crate) fn spawn_event_pump(
    router: Arc<MessageRouter>,
    mut events: mpsc::Receiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Accepted { addr } => router.pool().on_inbound_connection(addr).await,
                TransportEvent::Message { addr, bytes } => {
                    if let Some((peer_id, bytes)) = router.pool().on_message(addr, bytes).await {
                        let router = router.clone();
                        tokio::spawn(async move { router.dispatch(&bytes, peer_id).await });
                    }
                }
                TransportEvent::Disconnected { addr } => router.pool().on_disconnect(addr).await,
            }
        }
        log::debug!("Transport event stream closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::testing::wait_until;
    use crate::sync::{EntityKind, SyncEntity};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn config(port: u16, name: &str) -> OverlayConfig {
        OverlayConfig {
            port,
            name: name.to_string(),
            client_timeout_ms: 2_000,
            retry_attempts: 1,
            retry_delay_ms: 10,
            attachment_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn memory_node(network: &MemoryNetwork, port: u16, services: NodeServices) -> Arc<Node> {
        let (tx, rx) = mpsc::channel(256);
        let transport = Arc::new(network.endpoint(tx));
        let node = Node::new(config(port, &format!("node-{}", port)), services, transport, rx)
            .await
            .unwrap();
        node.start().await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_local_identity_is_stable() {
        let dir = tempdir().unwrap();
        let first = {
            let services = NodeServices::persistent(dir.path()).unwrap();
            Node::tcp(config(22201, "alpha"), services).await.unwrap().local().peer_id
        };

        let services = NodeServices::persistent(dir.path()).unwrap();
        let node = Node::tcp(config(22201, "alpha"), services).await.unwrap();
        assert_eq!(node.local().peer_id, first);
        assert_eq!(
            node.registry().find_by_id(&first).await.unwrap().unwrap().estado,
            PeerState::Online
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let (tx, rx) = mpsc::channel(1);
        let mut bad = config(1, "bad");
        bad.heartbeat_timeout_ms = bad.heartbeat_interval_ms;

        let result = Node::new(bad, NodeServices::in_memory(), Arc::new(network.endpoint(tx)), rx).await;
        assert!(matches!(result, Err(NodeError::Config(ConfigError::HeartbeatTimeout { .. }))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network, 1, NodeServices::in_memory()).await;
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));
        assert_eq!(node.status().await.listening.map(|a| a.port()), Some(1));
    }

    #[tokio::test]
    async fn test_connect_registers_and_syncs() {
        let network = MemoryNetwork::new();
        let a_services = NodeServices::in_memory();
        let b_services = NodeServices::in_memory();
        b_services
            .store
            .save(EntityKind::Channel, SyncEntity::new("general", json!({ "name": "general" })))
            .await
            .unwrap();

        let a = memory_node(&network, 1, a_services.clone()).await;
        let b = memory_node(&network, 2, b_services).await;
        let b_id = a.connect("127.0.0.1", 2).await.unwrap();
        assert_eq!(b_id, b.local().peer_id);

        let registry = a.registry().clone();
        wait_until(move || {
            let registry = registry.clone();
            async move { registry.find_by_id(&b_id).await.unwrap().is_some() }
        })
        .await;

        let store = a_services.store.clone();
        wait_until(move || {
            let store = store.clone();
            async move { store.get(EntityKind::Channel, "general").await.unwrap().is_some() }
        })
        .await;

        let status = a.status().await;
        assert_eq!(status.connected_peers, 1);
        assert_eq!(status.known_peers, 2);
    }

    #[tokio::test]
    async fn test_force_sync_pulls_new_entities() {
        let network = MemoryNetwork::new();
        let a_services = NodeServices::in_memory();
        let b_services = NodeServices::in_memory();
        let a = memory_node(&network, 1, a_services.clone()).await;
        let _b = memory_node(&network, 2, b_services.clone()).await;

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        a.events().subscribe(move |event| {
            if matches!(event, OverlayEvent::SyncCompleted { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        a.connect("127.0.0.1", 2).await.unwrap();
        let cold = completed.clone();
        wait_until(move || {
            let cold = cold.clone();
            async move { cold.load(Ordering::SeqCst) == EntityKind::ORDER.len() }
        })
        .await;

        b_services
            .store
            .save(EntityKind::Message, SyncEntity::new("m-late", json!({ "text": "after connect" })))
            .await
            .unwrap();
        assert!(a_services.store.get(EntityKind::Message, "m-late").await.unwrap().is_none());

        assert_eq!(a.force_sync().await, 1);
        assert!(a_services.store.get(EntityKind::Message, "m-late").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_handler_records_liveness() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 1, NodeServices::in_memory()).await;
        let b = memory_node(&network, 2, NodeServices::in_memory()).await;
        a.connect("127.0.0.1", 2).await.unwrap();

        let b_id = b.local().peer_id;
        let a_registry = a.registry().clone();
        wait_until(move || {
            let a_registry = a_registry.clone();
            async move { a_registry.find_by_id(&b_id).await.unwrap().is_some() }
        })
        .await;
        a.registry().mark_offline(&b_id).await.unwrap();

        let payload = serde_json::to_value(HeartbeatPayload {
            peer_id: b_id,
            timestamp: Utc::now(),
        })
        .unwrap();
        let response = a
            .router()
            .handle_local(RequestEnvelope::new(Action::Heartbeat, payload), b_id)
            .await;
        assert!(response.is_success());
        assert!(a.registry().find_by_id(&b_id).await.unwrap().unwrap().is_online());
    }

    #[tokio::test]
    async fn test_shutdown_marks_offline() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network, 1, NodeServices::in_memory()).await;
        node.shutdown().await;

        let me = node.local().peer_id;
        assert_eq!(
            node.registry().find_by_id(&me).await.unwrap().unwrap().estado,
            PeerState::Offline
        );
        assert!(!node.maintenance().is_running());
    }
}
