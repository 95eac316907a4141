//! Anti-entropy synchronization
//!
//! Shared entity collections (users, channels, memberships, messages, files)
//! are reconciled per entity type with a Merkle root comparison followed,
//! only on divergence, by an id exchange and per-entity fetches.

pub mod engine;
pub mod session;
pub mod store;

pub use engine::{SyncConfig, SyncEngine, SyncReport, MAX_ATTACHMENT_SIZE};
pub use session::{SyncPhase, SyncSession};
pub use store::{
    AttachmentStore, EntityStore, FsAttachmentStore, MemoryAttachmentStore, MemoryEntityStore,
    StoreError, SyncEntity,
};

use crate::network::message::PeerId;
use crate::network::router::RouterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Synchronization errors. Any of these aborts only the session it hit.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("A {kind} session with {peer_id} is already running")]
    SessionActive { peer_id: PeerId, kind: EntityKind },
    #[error("Session out of order: expected phase {expected:?}, was {actual:?}")]
    OutOfOrder {
        expected: SyncPhase,
        actual: SyncPhase,
    },
}

/// Entity types kept in sync between peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityKind {
    User,
    Channel,
    Member,
    Message,
    File,
}

impl EntityKind {
    /// Order in which a full sync visits entity types; later types refer to
    /// earlier ones
    pub const ORDER: [EntityKind; 5] = [
        EntityKind::User,
        EntityKind::Channel,
        EntityKind::Member,
        EntityKind::Message,
        EntityKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "USER",
            EntityKind::Channel => "CHANNEL",
            EntityKind::Member => "MEMBER",
            EntityKind::Message => "MESSAGE",
            EntityKind::File => "FILE",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "USER" => Ok(EntityKind::User),
            "CHANNEL" => Ok(EntityKind::Channel),
            "MEMBER" => Ok(EntityKind::Member),
            "MESSAGE" => Ok(EntityKind::Message),
            "FILE" => Ok(EntityKind::File),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}
