//! Maintenance scheduler
//!
//! Three independent periodic tasks keep the pool and the registry honest:
//!
//! - heartbeat: announce ourselves, then drop peers that have been silent
//!   for longer than the heartbeat timeout
//! - reconnection sweep: dial every ONLINE registry peer we are not
//!   connected to
//! - reconciliation: push liveness of connected peers into the registry,
//!   evict connected peers the registry no longer knows, and mark ONLINE
//!   peers we cannot reach as OFFLINE
//!
//! A failure for one peer never aborts the round for the others, and a
//! failed or panicking round never stops the next one.

use crate::config::OverlayConfig;
use crate::events::{EventBus, OverlayEvent};
use crate::network::message::{Action, HeartbeatPayload, PeerId, RequestEnvelope};
use crate::network::pool::ConnectionPool;
use crate::registry::{PeerRegistry, PeerState, RegistryError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconciliation_interval: Duration,
}

impl From<&OverlayConfig> for MaintenanceConfig {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            reconnect_interval: config.reconnect_interval(),
            reconciliation_interval: config.reconciliation_interval(),
        }
    }
}

/// Outcome of one reconnection sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub connected: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

/// Outcome of one reconciliation round
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    /// Connected peers whose heartbeat was recorded
    pub reported: Vec<PeerId>,
    /// Connected peers missing from the registry, now disconnected
    pub removed: Vec<PeerId>,
    /// ONLINE peers with no live link, now OFFLINE
    pub marked_offline: Vec<PeerId>,
}

/// Runs heartbeat checks, reconnection sweeps and registry reconciliation
pub struct MaintenanceScheduler {
    pool: Arc<ConnectionPool>,
    registry: Arc<dyn PeerRegistry>,
    events: Arc<EventBus>,
    config: MaintenanceConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<dyn PeerRegistry>,
        events: Arc<EventBus>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            events,
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the three periodic tasks
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            log::debug!("Maintenance already running");
            return;
        }

        let this = self.clone();
        tasks.push(spawn_periodic("heartbeat", self.config.heartbeat_interval, move || {
            let this = this.clone();
            async move {
                this.send_heartbeats().await;
                this.check_heartbeats(Utc::now()).await;
            }
        }));

        let this = self.clone();
        tasks.push(spawn_periodic("reconnect", self.config.reconnect_interval, move || {
            let this = this.clone();
            async move {
                this.reconnection_sweep().await;
            }
        }));

        let this = self.clone();
        tasks.push(spawn_periodic(
            "reconcile",
            self.config.reconciliation_interval,
            move || {
                let this = this.clone();
                async move {
                    this.reconcile_registry().await;
                }
            },
        ));

        log::info!(
            "Maintenance started (heartbeat {:?}, timeout {:?}, reconnect {:?}, reconcile {:?})",
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
            self.config.reconnect_interval,
            self.config.reconciliation_interval
        );
    }

    /// Abort the periodic tasks
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    // ===== Heartbeat =====

    /// Broadcast a heartbeat request to every connected peer
    pub async fn send_heartbeats(&self) -> usize {
        let payload = HeartbeatPayload {
            peer_id: self.pool.local().peer_id,
            timestamp: Utc::now(),
        };

        let request = match serde_json::to_value(&payload) {
            Ok(value) => RequestEnvelope::new(Action::Heartbeat, value),
            Err(e) => {
                log::error!("Failed to encode heartbeat: {}", e);
                return 0;
            }
        };

        match request.to_bytes() {
            Ok(bytes) => self.pool.broadcast(bytes).await,
            Err(e) => {
                log::error!("Failed to encode heartbeat: {}", e);
                0
            }
        }
    }

    /// Disconnect every peer silent for longer than the heartbeat timeout
    pub async fn check_heartbeats(&self, now: DateTime<Utc>) -> Vec<PeerId> {
        let timeout = match chrono::Duration::from_std(self.config.heartbeat_timeout) {
            Ok(timeout) => timeout,
            Err(e) => {
                log::error!("Invalid heartbeat timeout: {}", e);
                return Vec::new();
            }
        };

        let expired = self.pool.expired(now, timeout).await;
        for peer_id in &expired {
            let last = self.pool.last_heartbeat(peer_id).await;
            log::warn!(
                "Peer {} missed heartbeats (last seen {:?}), disconnecting",
                peer_id,
                last
            );
            self.pool.disconnect(peer_id).await;
        }
        expired
    }

    // ===== Reconnection =====

    /// Try to connect to every ONLINE registry peer that is not connected
    pub async fn reconnection_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let online = match self.registry.find_by_state(PeerState::Online).await {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("Reconnection sweep skipped, registry unavailable: {}", e);
                return report;
            }
        };

        let local_id = self.pool.local().peer_id;
        for record in online {
            if record.peer_id == local_id || self.pool.is_connected(&record.peer_id).await {
                continue;
            }

            log::debug!("Reconnecting to {} at {}:{}", record.peer_id, record.ip, record.puerto);
            match self.pool.connect(&record.ip, record.puerto).await {
                Ok(peer_id) => {
                    if peer_id != record.peer_id {
                        log::warn!(
                            "{}:{} answered as {} instead of {}",
                            record.ip,
                            record.puerto,
                            peer_id,
                            record.peer_id
                        );
                    }
                    report.connected.push(peer_id);
                }
                Err(e) => {
                    log::warn!("Reconnection to {} failed: {}", record.peer_id, e);
                    report.failed.push(record.peer_id);
                }
            }
        }

        if !report.connected.is_empty() {
            log::info!("Reconnected to {} peer(s)", report.connected.len());
        }
        report
    }

    // ===== Reconciliation =====

    /// Bring registry state and the connection pool back in line
    pub async fn reconcile_registry(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let local = self.pool.local().clone();
        let now = Utc::now();

        if let Err(e) = self.registry.upsert_online(&local).await {
            log::warn!("Failed to refresh local peer {}: {}", local.peer_id, e);
        }

        let connected = self.pool.connected_peers().await;
        for peer_id in &connected {
            if *peer_id == local.peer_id {
                continue;
            }

            match self.registry.report_heartbeat(peer_id, now).await {
                Ok(()) => report.reported.push(*peer_id),
                Err(RegistryError::PeerNotFound(_)) => {
                    log::warn!("Peer {} no longer in registry, dropping it", peer_id);
                    self.pool.disconnect(peer_id).await;
                    self.events.publish(OverlayEvent::PeerRemoved { peer_id: *peer_id });
                    report.removed.push(*peer_id);
                }
                Err(e) => {
                    log::warn!("Failed to report heartbeat for {}: {}", peer_id, e);
                }
            }
        }

        let online = match self.registry.find_by_state(PeerState::Online).await {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("Reconciliation could not list ONLINE peers: {}", e);
                return report;
            }
        };

        for record in online {
            if record.peer_id == local.peer_id || connected.contains(&record.peer_id) {
                continue;
            }

            match self.registry.mark_offline(&record.peer_id).await {
                Ok(()) => {
                    log::info!("Peer {} marked OFFLINE", record.peer_id);
                    self.events.publish(OverlayEvent::PeerMarkedOffline {
                        peer_id: record.peer_id,
                    });
                    report.marked_offline.push(record.peer_id);
                }
                Err(e) => {
                    log::warn!("Failed to mark {} OFFLINE: {}", record.peer_id, e);
                }
            }
        }

        log::debug!(
            "Reconciliation: {} reported, {} removed, {} marked offline",
            report.reported.len(),
            report.removed.len(),
            report.marked_offline.len()
        );
        report
    }
}

/// Run `tick` every `period`, first after one full period. A panicking tick
/// is logged and the loop carries on.
pub(crate) fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if AssertUnwindSafe(tick()).catch_unwind().await.is_err() {
                log::error!("{} round panicked; continuing on next tick", name);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::message::PeerDescriptor;
    use crate::network::testing::{link, test_peer, wait_until, TestPeer};
    use crate::registry::{MemoryPeerRegistry, PeerRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(peer: &TestPeer, registry: Arc<MemoryPeerRegistry>, config: MaintenanceConfig) -> Arc<MaintenanceScheduler> {
        Arc::new(MaintenanceScheduler::new(
            peer.pool.clone(),
            registry,
            peer.events.clone(),
            config,
        ))
    }

    fn standard() -> MaintenanceConfig {
        MaintenanceConfig {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            reconnect_interval: Duration::from_secs(60),
            reconciliation_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_stale_peer_is_disconnected() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 7001).await;
        let b = test_peer(&network, 7002).await;
        link(&a, &b).await;

        let maintenance = scheduler(&a, Arc::new(MemoryPeerRegistry::new()), standard());
        let now = Utc::now();

        assert!(maintenance.check_heartbeats(now).await.is_empty());

        a.pool.touch_at(&b.id(), now - chrono::Duration::seconds(95)).await;
        assert_eq!(maintenance.check_heartbeats(now).await, vec![b.id()]);
        assert!(!a.pool.is_connected(&b.id()).await);
    }

    #[tokio::test]
    async fn test_reconnection_sweep() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 7011).await;
        let b = test_peer(&network, 7012).await;
        let registry = Arc::new(MemoryPeerRegistry::new());

        let dead = PeerDescriptor::new(PeerId::new(), "127.0.0.1", 7019, "dead");
        let offline = PeerDescriptor::new(PeerId::new(), "127.0.0.1", 7018, "offline");
        registry.upsert_online(a.pool.local()).await.unwrap();
        registry.upsert_online(b.pool.local()).await.unwrap();
        registry.upsert_online(&dead).await.unwrap();
        registry
            .save(PeerRecord::new(&offline, PeerState::Offline))
            .await
            .unwrap();

        let maintenance = scheduler(&a, registry, standard());
        let report = maintenance.reconnection_sweep().await;

        assert_eq!(report.connected, vec![b.id()]);
        assert_eq!(report.failed, vec![dead.peer_id]);
        assert!(a.pool.is_connected(&b.id()).await);

        // Already connected peers are skipped
        let again = maintenance.reconnection_sweep().await;
        assert!(again.connected.is_empty());
        assert_eq!(again.failed, vec![dead.peer_id]);
    }

    #[tokio::test]
    async fn test_reconciliation() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 7021).await;
        let b = test_peer(&network, 7022).await;
        let c = test_peer(&network, 7023).await;
        link(&a, &b).await;
        link(&a, &c).await;

        let registry = Arc::new(MemoryPeerRegistry::new());
        let gone = PeerDescriptor::new(PeerId::new(), "127.0.0.1", 7029, "gone");
        registry.upsert_online(b.pool.local()).await.unwrap();
        registry.upsert_online(&gone).await.unwrap();
        // c is connected but was deleted from the registry out-of-band

        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        a.events.subscribe(move |event| {
            if matches!(event, OverlayEvent::PeerRemoved { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let maintenance = scheduler(&a, registry.clone(), standard());
        let report = maintenance.reconcile_registry().await;

        assert_eq!(report.reported, vec![b.id()]);
        assert_eq!(report.removed, vec![c.id()]);
        assert_eq!(report.marked_offline, vec![gone.peer_id]);
        assert!(!a.pool.is_connected(&c.id()).await);
        assert!(a.pool.is_connected(&b.id()).await);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        let gone_record = registry.find_by_id(&gone.peer_id).await.unwrap().unwrap();
        assert_eq!(gone_record.estado, PeerState::Offline);

        // Local peer is kept ONLINE
        let local = registry.find_by_id(&a.id()).await.unwrap().unwrap();
        assert!(local.is_online());
    }

    #[tokio::test]
    async fn test_periodic_tasks_run_and_stop() {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, 7031).await;
        let registry = Arc::new(MemoryPeerRegistry::new());
        let gone = PeerDescriptor::new(PeerId::new(), "127.0.0.1", 7039, "gone");
        registry.upsert_online(&gone).await.unwrap();
        let gone_id = gone.peer_id;

        let maintenance = scheduler(
            &a,
            registry.clone(),
            MaintenanceConfig {
                heartbeat_interval: Duration::from_millis(20),
                heartbeat_timeout: Duration::from_millis(60),
                reconnect_interval: Duration::from_millis(40),
                reconciliation_interval: Duration::from_millis(20),
            },
        );
        maintenance.start();
        assert!(maintenance.is_running());

        wait_until(|| {
            let registry = registry.clone();
            async move {
                registry
                    .find_by_id(&gone_id)
                    .await
                    .unwrap()
                    .map(|r| r.estado == PeerState::Offline)
                    .unwrap_or(false)
            }
        })
        .await;

        maintenance.stop();
        assert!(!maintenance.is_running());
    }

    #[tokio::test]
    async fn test_panicking_round_does_not_stop_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let task = spawn_periodic("flaky", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first round fails");
                }
            }
        });

        wait_until(|| {
            let ticks = ticks.clone();
            async move { ticks.load(Ordering::SeqCst) >= 3 }
        })
        .await;
        task.abort();
    }
}
