//! In-process transport
//!
//! [`MemoryNetwork`] connects any number of [`MemoryTransport`] endpoints
//! without sockets. Frames are delivered in order per link, which is all the
//! overlay expects from a real transport. Used by tests and simulations.

use crate::network::transport::{check_frame_size, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// First port handed out for the connecting side of a link
const EPHEMERAL_BASE: u16 = 49152;

type EndpointId = usize;

struct Endpoint {
    events: mpsc::Sender<TransportEvent>,
    listen: Option<SocketAddr>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<EndpointId, Endpoint>,
    listeners: HashMap<SocketAddr, EndpointId>,
    /// (endpoint, remote address as that endpoint sees it) -> the other end
    links: HashMap<(EndpointId, SocketAddr), (EndpointId, SocketAddr)>,
    next_endpoint: EndpointId,
    next_ephemeral: u16,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an endpoint reporting into `events`
    pub fn endpoint(&self, events: mpsc::Sender<TransportEvent>) -> MemoryTransport {
        let mut state = self.lock();
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        state.endpoints.insert(id, Endpoint { events, listen: None });

        MemoryTransport {
            network: self.clone(),
            id,
        }
    }

    /// Number of live links (each counted once)
    pub fn link_count(&self) -> usize {
        self.lock().links.len() / 2
    }

    /// Tear down a link from both sides, as if the wire was cut
    pub async fn sever(&self, a: &MemoryTransport, remote: SocketAddr) {
        let notify = {
            let mut state = self.lock();
            let Some((peer, seen_as)) = state.links.remove(&(a.id, remote)) else {
                return;
            };
            state.links.remove(&(peer, seen_as));
            [
                (state.endpoints.get(&a.id).map(|e| e.events.clone()), remote),
                (state.endpoints.get(&peer).map(|e| e.events.clone()), seen_as),
            ]
        };

        for (events, addr) in notify {
            if let Some(events) = events {
                let _ = events.send(TransportEvent::Disconnected { addr }).await;
            }
        }
    }
}

/// One endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: EndpointId,
}

impl MemoryTransport {
    /// Address this endpoint listens on, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.network
            .lock()
            .endpoints
            .get(&self.id)
            .and_then(|e| e.listen)
    }

    fn unlink(&self, state: &mut NetworkState, remote: SocketAddr) -> Option<(mpsc::Sender<TransportEvent>, SocketAddr)> {
        let (peer, seen_as) = state.links.remove(&(self.id, remote))?;
        state.links.remove(&(peer, seen_as));
        state
            .endpoints
            .get(&peer)
            .map(|e| (e.events.clone(), seen_as))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, port: u16) -> Result<SocketAddr, TransportError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let mut state = self.network.lock();

        if state.listeners.contains_key(&addr) {
            return Err(TransportError::IoError(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{} already in use", addr),
            )));
        }

        state.listeners.insert(addr, self.id);
        if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
            endpoint.listen = Some(addr);
        }

        log::debug!("Memory endpoint {} listening on {}", self.id, addr);
        Ok(addr)
    }

    async fn connect_to(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| TransportError::ConnectionFailed(format!("unknown host {}", host)))?;
        let target = SocketAddr::new(ip, port);

        let (events, seen_as) = {
            let mut state = self.network.lock();

            let peer = *state
                .listeners
                .get(&target)
                .ok_or_else(|| TransportError::ConnectionFailed(format!("{} refused", target)))?;

            if state.links.contains_key(&(self.id, target)) {
                return Err(TransportError::ConnectionFailed(format!(
                    "already linked to {}",
                    target
                )));
            }

            let port = EPHEMERAL_BASE.wrapping_add(state.next_ephemeral);
            state.next_ephemeral = state.next_ephemeral.wrapping_add(1);
            let seen_as = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

            state.links.insert((self.id, target), (peer, seen_as));
            state.links.insert((peer, seen_as), (self.id, target));

            let events = state
                .endpoints
                .get(&peer)
                .map(|e| e.events.clone())
                .ok_or_else(|| TransportError::ConnectionFailed(format!("{} refused", target)))?;
            (events, seen_as)
        };

        events
            .send(TransportEvent::Accepted { addr: seen_as })
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{} refused", target)))?;

        Ok(target)
    }

    async fn send(&self, addr: SocketAddr, bytes: Bytes) -> Result<(), TransportError> {
        check_frame_size(&bytes)?;
        let (events, seen_as) = {
            let state = self.network.lock();
            let (peer, seen_as) = *state
                .links
                .get(&(self.id, addr))
                .ok_or(TransportError::NotConnected(addr))?;
            let events = state
                .endpoints
                .get(&peer)
                .map(|e| e.events.clone())
                .ok_or(TransportError::Closed(addr))?;
            (events, seen_as)
        };

        events
            .send(TransportEvent::Message { addr: seen_as, bytes })
            .await
            .map_err(|_| TransportError::Closed(addr))
    }

    async fn close(&self, addr: SocketAddr) {
        let notify = {
            let mut state = self.network.lock();
            self.unlink(&mut state, addr)
        };

        if let Some((events, seen_as)) = notify {
            let _ = events.send(TransportEvent::Disconnected { addr: seen_as }).await;
        }
    }

    async fn shutdown(&self) {
        let notify: Vec<_> = {
            let mut state = self.network.lock();
            if let Some(addr) = state.endpoints.get_mut(&self.id).and_then(|e| e.listen.take()) {
                state.listeners.remove(&addr);
            }

            let remotes: Vec<SocketAddr> = state
                .links
                .keys()
                .filter(|(id, _)| *id == self.id)
                .map(|(_, remote)| *remote)
                .collect();
            remotes
                .into_iter()
                .filter_map(|remote| self.unlink(&mut state, remote))
                .collect()
        };

        for (events, seen_as) in notify {
            let _ = events.send(TransportEvent::Disconnected { addr: seen_as }).await;
        }
    }
}
