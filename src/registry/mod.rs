//! Peer registry
//!
//! Durable record of every peer we have heard of. The registry is the single
//! source of truth for peer state that outlives a connection; the connection
//! pool only knows who is reachable right now. Writes are last-write-wins
//! per peer id.

pub mod memory;
pub mod persistence;

pub use memory::MemoryPeerRegistry;
pub use persistence::{JsonPeerRegistry, REGISTRY_FILE};

use crate::network::message::{PeerDescriptor, PeerId};
use crate::network::router::HandlerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<RegistryError> for HandlerError {
    fn from(e: RegistryError) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// Durable peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerState {
    Online,
    Offline,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Online => f.write_str("ONLINE"),
            PeerState::Offline => f.write_str("OFFLINE"),
        }
    }
}

/// A peer as stored in the registry. Serialised as a directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub ip: String,
    pub puerto: u16,
    pub estado: PeerState,
    pub ultimo_latido: Option<DateTime<Utc>>,
    pub nombre_servidor: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(descriptor: &PeerDescriptor, estado: PeerState) -> Self {
        let now = Utc::now();
        Self {
            peer_id: descriptor.peer_id,
            ip: descriptor.ip.clone(),
            puerto: descriptor.puerto,
            estado,
            ultimo_latido: Some(now),
            nombre_servidor: descriptor.nombre_servidor.clone(),
            created_at: now,
        }
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.peer_id, self.ip.clone(), self.puerto, self.nombre_servidor.clone())
    }

    pub fn is_online(&self) -> bool {
        self.estado == PeerState::Online
    }
}

/// Persistence boundary for peer records
#[async_trait]
pub trait PeerRegistry: Send + Sync {
    async fn find_by_id(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>, RegistryError>;

    async fn find_all(&self) -> Result<Vec<PeerRecord>, RegistryError>;

    /// Insert or overwrite a record
    async fn save(&self, record: PeerRecord) -> Result<(), RegistryError>;

    /// Delete a record; returns whether it existed
    async fn remove(&self, peer_id: &PeerId) -> Result<bool, RegistryError>;

    async fn find_by_state(&self, state: PeerState) -> Result<Vec<PeerRecord>, RegistryError> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .filter(|p| p.estado == state)
            .collect())
    }

    async fn count_by_state(&self, state: PeerState) -> Result<usize, RegistryError> {
        Ok(self.find_by_state(state).await?.len())
    }

    async fn find_by_address(&self, ip: &str, puerto: u16) -> Result<Option<PeerRecord>, RegistryError> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .find(|p| p.ip == ip && p.puerto == puerto))
    }

    /// Record a heartbeat. Fails with [`RegistryError::PeerNotFound`] when
    /// the peer is not in the registry.
    async fn report_heartbeat(&self, peer_id: &PeerId, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut record = self
            .find_by_id(peer_id)
            .await?
            .ok_or(RegistryError::PeerNotFound(*peer_id))?;
        record.estado = PeerState::Online;
        record.ultimo_latido = Some(at);
        self.save(record).await
    }

    async fn mark_offline(&self, peer_id: &PeerId) -> Result<(), RegistryError> {
        let mut record = self
            .find_by_id(peer_id)
            .await?
            .ok_or(RegistryError::PeerNotFound(*peer_id))?;
        record.estado = PeerState::Offline;
        self.save(record).await
    }

    /// Insert or refresh a peer as ONLINE, keeping its creation time
    async fn upsert_online(&self, descriptor: &PeerDescriptor) -> Result<PeerRecord, RegistryError> {
        let record = match self.find_by_id(&descriptor.peer_id).await? {
            Some(mut existing) => {
                existing.ip = descriptor.ip.clone();
                existing.puerto = descriptor.puerto;
                existing.nombre_servidor = descriptor.nombre_servidor.clone();
                existing.estado = PeerState::Online;
                existing.ultimo_latido = Some(Utc::now());
                existing
            }
            None => PeerRecord::new(descriptor, PeerState::Online),
        };
        self.save(record.clone()).await?;
        Ok(record)
    }
}
