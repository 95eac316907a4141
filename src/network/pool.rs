//! Connection pool
//!
//! Tracks every live link and which peer it belongs to. A connection is
//! known only by its remote address until the handshake tells us the peer
//! id, at which point it is bound to that peer. A peer may hold one inbound
//! and one outbound link at the same time; binding a second link in the same
//! direction replaces (and closes) the first.

use crate::config::OverlayConfig;
use crate::events::{EventBus, OverlayEvent};
use crate::network::message::{
    Action, Frame, PeerDescriptor, PeerId, RequestEnvelope, ResponseEnvelope,
};
use crate::network::transport::{Direction, Transport, TransportError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};

/// Connection pool errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("Refusing to connect to ourselves")]
    SelfConnection,
    #[error("Write to {0} timed out")]
    WriteTimeout(SocketAddr),
}

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&OverlayConfig> for PoolConfig {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            handshake_timeout: config.client_timeout(),
            write_timeout: config.write_timeout(),
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Information about one live link
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Set once the handshake completed
    pub peer_id: Option<PeerId>,
    /// Last time any frame arrived on this link
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct PeerLinks {
    descriptor: PeerDescriptor,
    inbound: Option<SocketAddr>,
    outbound: Option<SocketAddr>,
}

impl PeerLinks {
    fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            inbound: None,
            outbound: None,
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut Option<SocketAddr> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    /// Outbound first: that is the link we opened and handshook ourselves
    fn addrs(&self) -> Vec<SocketAddr> {
        self.outbound.iter().chain(self.inbound.iter()).copied().collect()
    }

    fn is_empty(&self) -> bool {
        self.inbound.is_none() && self.outbound.is_none()
    }
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<SocketAddr, ConnectionInfo>,
    peers: HashMap<PeerId, PeerLinks>,
}

impl PoolState {
    /// Forget a link; returns the peer that lost its last link, if any
    fn unlink(&mut self, addr: &SocketAddr) -> Option<PeerId> {
        let info = self.connections.remove(addr)?;
        let peer_id = info.peer_id?;

        let links = self.peers.get_mut(&peer_id)?;
        let slot = links.slot(info.direction);
        if *slot == Some(*addr) {
            *slot = None;
        }

        if links.is_empty() {
            self.peers.remove(&peer_id);
            Some(peer_id)
        } else {
            None
        }
    }

    fn last_seen(&self, links: &PeerLinks) -> Option<DateTime<Utc>> {
        links
            .addrs()
            .iter()
            .filter_map(|a| self.connections.get(a))
            .map(|c| c.last_seen)
            .max()
    }
}

type HandshakeResult = Result<PeerDescriptor, PeerError>;

/// Manages all peer connections
pub struct ConnectionPool {
    local: PeerDescriptor,
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    events: Arc<EventBus>,
    state: RwLock<PoolState>,
    pending_handshakes: Mutex<HashMap<SocketAddr, oneshot::Sender<HandshakeResult>>>,
    /// Serialises concurrent `connect` calls to the same address
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionPool {
    pub fn new(
        local: PeerDescriptor,
        transport: Arc<dyn Transport>,
        config: PoolConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            local,
            transport,
            config,
            events,
            state: RwLock::new(PoolState::default()),
            pending_handshakes: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Our own descriptor
    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    // ===== Outbound =====

    /// Connect to a peer and complete the handshake.
    ///
    /// Idempotent: if a peer advertising `host:port` is already connected its
    /// id is returned without opening anything. Concurrent calls for the same
    /// address wait for the first one instead of racing a second handshake.
    pub async fn connect(&self, host: &str, port: u16) -> Result<PeerId, PeerError> {
        if host == self.local.ip && port == self.local.puerto {
            return Err(PeerError::SelfConnection);
        }

        let address = format!("{}:{}", host, port);
        let lock = self
            .connect_locks
            .lock()
            .await
            .entry(address.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.connect_serialized(host, port, &address).await
        };

        // Drop the address lock once nobody else is waiting on it
        let mut locks = self.connect_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&address);
        }
        result
    }

    async fn connect_serialized(&self, host: &str, port: u16, address: &str) -> Result<PeerId, PeerError> {
        if let Some(peer_id) = self.peer_at(host, port).await {
            log::debug!("Already connected to {} as {}", address, peer_id);
            return Ok(peer_id);
        }

        let mut last_error = None;
        for attempt in 1..=self.config.retry_attempts.max(1) {
            match self.try_connect(host, port).await {
                Ok(peer_id) => return Ok(peer_id),
                Err(PeerError::SelfConnection) => return Err(PeerError::SelfConnection),
                Err(e) => {
                    log::debug!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        self.config.retry_attempts,
                        address,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.config.retry_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PeerError::ConnectionFailed(address.to_string())))
    }

    async fn try_connect(&self, host: &str, port: u16) -> Result<PeerId, PeerError> {
        let addr = self.transport.connect_to(host, port).await?;

        let (tx, rx) = oneshot::channel();
        self.pending_handshakes.lock().await.insert(addr, tx);
        self.register(addr, Direction::Outbound).await;

        let handshake = RequestEnvelope::new(Action::Handshake, serde_json::to_value(&self.local)?);
        if let Err(e) = self.write(addr, handshake.to_bytes()?).await {
            self.pending_handshakes.lock().await.remove(&addr);
            self.drop_connection(addr).await;
            return Err(e);
        }
        log::debug!("Sent handshake to {}", addr);

        match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Ok(Ok(Ok(remote))) => Ok(remote.peer_id),
            Ok(Ok(Err(e))) => {
                self.drop_connection(addr).await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.drop_connection(addr).await;
                Err(PeerError::ConnectionFailed(format!("{} closed during handshake", addr)))
            }
            Err(_) => {
                self.pending_handshakes.lock().await.remove(&addr);
                self.drop_connection(addr).await;
                Err(PeerError::HandshakeTimeout(addr))
            }
        }
    }

    // ===== Transport callbacks =====

    /// A remote peer opened a link to us
    pub async fn on_inbound_connection(&self, addr: SocketAddr) {
        log::info!("Inbound connection from {}", addr);
        self.register(addr, Direction::Inbound).await;
    }

    /// A frame arrived. Handshakes are consumed here; every other frame is
    /// handed back with the peer it came from. Frames on links that have not
    /// completed a handshake are dropped.
    pub async fn on_message(&self, addr: SocketAddr, bytes: Bytes) -> Option<(PeerId, Bytes)> {
        self.touch(addr).await;

        match Frame::decode(&bytes) {
            Ok(Frame::Request(request)) if request.action == Action::Handshake => {
                self.accept_handshake(addr, request).await;
                return None;
            }
            Ok(Frame::Response(response)) if response.action == Action::Handshake => {
                self.complete_handshake(addr, response).await;
                return None;
            }
            _ => {}
        }

        let peer_id = self.state.read().await.connections.get(&addr)?.peer_id;
        match peer_id {
            Some(peer_id) => Some((peer_id, bytes)),
            None => {
                log::debug!("Dropping frame from {} before handshake", addr);
                None
            }
        }
    }

    /// The transport lost a link
    pub async fn on_disconnect(&self, addr: SocketAddr) {
        if let Some(tx) = self.pending_handshakes.lock().await.remove(&addr) {
            let _ = tx.send(Err(PeerError::ConnectionFailed(format!(
                "{} closed during handshake",
                addr
            ))));
        }

        let lost = self.state.write().await.unlink(&addr);
        log::debug!("Connection {} closed", addr);

        if let Some(peer_id) = lost {
            log::info!("Peer {} disconnected", peer_id);
            self.events.publish(OverlayEvent::PeerDisconnected {
                peer_id,
                reason: "connection closed".to_string(),
            });
        }
    }

    // ===== Handshake =====

    async fn accept_handshake(&self, addr: SocketAddr, request: RequestEnvelope) {
        let descriptor: PeerDescriptor = match serde_json::from_value(request.payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::warn!("Invalid handshake from {}: {}", addr, e);
                let reply = ResponseEnvelope::error(Action::Handshake, format!("invalid handshake: {}", e))
                    .with_request_id(request.request_id);
                self.reply_and_close(addr, reply).await;
                return;
            }
        };

        if descriptor.peer_id == self.local.peer_id {
            log::warn!("Refusing handshake from ourselves on {}", addr);
            let reply = ResponseEnvelope::error(Action::Handshake, "self connection refused")
                .with_request_id(request.request_id);
            self.reply_and_close(addr, reply).await;
            return;
        }

        let reply = match serde_json::to_value(&self.local) {
            Ok(local) => ResponseEnvelope::success(Action::Handshake, "handshake accepted")
                .with_data(local)
                .with_request_id(request.request_id),
            Err(e) => {
                log::error!("Failed to encode local descriptor: {}", e);
                return;
            }
        };

        // Reply before binding so the remote is bound first when our own
        // traffic starts flowing
        match reply.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.write(addr, bytes).await {
                    log::warn!("Failed to answer handshake from {}: {}", addr, e);
                    self.drop_connection(addr).await;
                    return;
                }
            }
            Err(e) => {
                log::error!("Failed to encode handshake reply: {}", e);
                return;
            }
        }

        self.bind(addr, descriptor).await;
    }

    async fn complete_handshake(&self, addr: SocketAddr, response: ResponseEnvelope) {
        let Some(tx) = self.pending_handshakes.lock().await.remove(&addr) else {
            log::debug!("Unexpected handshake reply from {}", addr);
            return;
        };

        let result = match response.into_data() {
            Err(message) => Err(PeerError::InvalidHandshake(message)),
            Ok(data) => match serde_json::from_value::<PeerDescriptor>(data) {
                Err(e) => Err(PeerError::InvalidHandshake(e.to_string())),
                Ok(remote) if remote.peer_id == self.local.peer_id => Err(PeerError::SelfConnection),
                Ok(remote) => {
                    self.bind(addr, remote.clone()).await;
                    Ok(remote)
                }
            },
        };

        if tx.send(result).is_err() {
            log::debug!("Handshake waiter for {} is gone", addr);
        }
    }

    async fn reply_and_close(&self, addr: SocketAddr, reply: ResponseEnvelope) {
        if let Ok(bytes) = reply.to_bytes() {
            let _ = self.write(addr, bytes).await;
        }
        self.drop_connection(addr).await;
    }

    /// Attach a link to a peer id, replacing any older link in the same direction
    async fn bind(&self, addr: SocketAddr, descriptor: PeerDescriptor) {
        let peer_id = descriptor.peer_id;

        let (direction, newly_connected, replaced) = {
            let mut state = self.state.write().await;

            let direction = match state.connections.get_mut(&addr) {
                Some(info) => {
                    info.peer_id = Some(peer_id);
                    info.direction
                }
                None => {
                    log::debug!("Connection {} vanished before handshake completed", addr);
                    return;
                }
            };

            let links = state
                .peers
                .entry(peer_id)
                .or_insert_with(|| PeerLinks::new(descriptor.clone()));
            links.descriptor = descriptor.clone();
            let newly_connected = links.is_empty();
            let replaced = links.slot(direction).replace(addr).filter(|old| *old != addr);

            if let Some(old) = replaced {
                state.connections.remove(&old);
            }

            (direction, newly_connected, replaced)
        };

        if let Some(old) = replaced {
            log::info!(
                "Replacing {:?} link to {} ({} -> {})",
                direction,
                peer_id,
                old,
                addr
            );
            self.transport.close(old).await;
        }

        log::info!(
            "Peer {} ({}) bound to {} [{:?}]",
            peer_id,
            descriptor.nombre_servidor,
            addr,
            direction
        );

        if newly_connected {
            self.events.publish(OverlayEvent::PeerConnected {
                peer: descriptor,
                addr,
                direction,
            });
        }
    }

    // ===== Queries =====

    /// Whether at least one live link to the peer exists
    pub async fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.state.read().await.peers.contains_key(peer_id)
    }

    /// Ids of all connected peers
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.state.read().await.peers.keys().copied().collect()
    }

    /// Descriptors of all connected peers
    pub async fn connected_descriptors(&self) -> Vec<PeerDescriptor> {
        self.state
            .read()
            .await
            .peers
            .values()
            .map(|links| links.descriptor.clone())
            .collect()
    }

    pub async fn descriptor(&self, peer_id: &PeerId) -> Option<PeerDescriptor> {
        self.state
            .read()
            .await
            .peers
            .get(peer_id)
            .map(|links| links.descriptor.clone())
    }

    /// Live links of one peer
    pub async fn connections_of(&self, peer_id: &PeerId) -> Vec<ConnectionInfo> {
        let state = self.state.read().await;
        state
            .peers
            .get(peer_id)
            .map(|links| {
                links
                    .addrs()
                    .iter()
                    .filter_map(|a| state.connections.get(a).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of links, bound or not
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Connected peer advertising `host:port`
    pub async fn peer_at(&self, host: &str, port: u16) -> Option<PeerId> {
        self.state
            .read()
            .await
            .peers
            .iter()
            .find(|(_, links)| links.descriptor.ip == host && links.descriptor.puerto == port)
            .map(|(id, _)| *id)
    }

    /// Most recent frame seen from the peer on any link
    pub async fn last_heartbeat(&self, peer_id: &PeerId) -> Option<DateTime<Utc>> {
        let state = self.state.read().await;
        let links = state.peers.get(peer_id)?;
        state.last_seen(links)
    }

    /// Peers whose most recent frame is older than `timeout`
    pub async fn expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<PeerId> {
        let state = self.state.read().await;
        state
            .peers
            .iter()
            .filter(|(_, links)| {
                state
                    .last_seen(links)
                    .map(|seen| now - seen > timeout)
                    .unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Record liveness on a link
    pub async fn touch(&self, addr: SocketAddr) {
        if let Some(info) = self.state.write().await.connections.get_mut(&addr) {
            info.last_seen = Utc::now();
        }
    }

    /// Override the liveness timestamp of every link of a peer
    pub async fn touch_at(&self, peer_id: &PeerId, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let addrs = match state.peers.get(peer_id) {
            Some(links) => links.addrs(),
            None => return,
        };
        for addr in addrs {
            if let Some(info) = state.connections.get_mut(&addr) {
                info.last_seen = at;
            }
        }
    }

    // ===== Sending =====

    /// Send a frame to a peer, trying the other link if the first fails
    pub async fn send(&self, peer_id: &PeerId, bytes: Bytes) -> Result<(), PeerError> {
        let addrs = self
            .state
            .read()
            .await
            .peers
            .get(peer_id)
            .map(|links| links.addrs())
            .ok_or(PeerError::NotConnected(*peer_id))?;

        let mut last_error = PeerError::NotConnected(*peer_id);
        for addr in addrs {
            match self.write(addr, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("Send to {} via {} failed: {}", peer_id, addr, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Send a frame to every connected peer; returns how many accepted it
    pub async fn broadcast(&self, bytes: Bytes) -> usize {
        let mut delivered = 0;
        for peer_id in self.connected_peers().await {
            match self.send(&peer_id, bytes.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("Failed to send to {}: {}", peer_id, e),
            }
        }
        delivered
    }

    async fn write(&self, addr: SocketAddr, bytes: Bytes) -> Result<(), PeerError> {
        tokio::time::timeout(self.config.write_timeout, self.transport.send(addr, bytes))
            .await
            .map_err(|_| PeerError::WriteTimeout(addr))??;
        Ok(())
    }

    // ===== Teardown =====

    /// Close every link to a peer. Returns false if it was not connected.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let addrs = {
            let mut state = self.state.write().await;
            let Some(links) = state.peers.remove(peer_id) else {
                return false;
            };
            let addrs = links.addrs();
            for addr in &addrs {
                state.connections.remove(addr);
            }
            addrs
        };

        for addr in addrs {
            self.transport.close(addr).await;
        }

        log::info!("Disconnected peer {}", peer_id);
        self.events.publish(OverlayEvent::PeerDisconnected {
            peer_id: *peer_id,
            reason: "closed locally".to_string(),
        });
        true
    }

    /// Close every link
    pub async fn disconnect_all(&self) {
        for peer_id in self.connected_peers().await {
            self.disconnect(&peer_id).await;
        }
    }

    async fn register(&self, addr: SocketAddr, direction: Direction) {
        self.state.write().await.connections.insert(
            addr,
            ConnectionInfo {
                addr,
                direction,
                peer_id: None,
                last_seen: Utc::now(),
            },
        );
    }

    async fn drop_connection(&self, addr: SocketAddr) {
        let lost = self.state.write().await.unlink(&addr);
        self.transport.close(addr).await;

        if let Some(peer_id) = lost {
            self.events.publish(OverlayEvent::PeerDisconnected {
                peer_id,
                reason: "connection dropped".to_string(),
            });
        }
    }
}
