//! Overlay events
//!
//! Components publish typed events to an [`EventBus`]; interested parties
//! subscribe with a callback. Callbacks run on the publisher's task and must
//! not block: anything slow should be spawned.

use crate::network::message::{PeerDescriptor, PeerId};
use crate::network::transport::Direction;
use crate::sync::EntityKind;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Something that happened in the overlay
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// First live link to a peer completed its handshake
    PeerConnected {
        peer: PeerDescriptor,
        addr: SocketAddr,
        direction: Direction,
    },
    /// Last live link to a peer went away
    PeerDisconnected { peer_id: PeerId, reason: String },
    /// Peer vanished from the registry and was dropped from the pool
    PeerRemoved { peer_id: PeerId },
    /// Registry said ONLINE but nothing was connected
    PeerMarkedOffline { peer_id: PeerId },
    /// A sync round for one entity type finished
    SyncCompleted {
        peer_id: PeerId,
        kind: EntityKind,
        fetched: usize,
    },
    /// A sync round for one entity type was abandoned
    SyncAborted {
        peer_id: PeerId,
        kind: EntityKind,
        reason: String,
    },
    /// Attachments downloaded after a sync round
    AttachmentsFetched { peer_id: PeerId, count: usize },
}

/// Subscriber callback
pub type Subscriber = Arc<dyn Fn(&OverlayEvent) + Send + Sync>;

/// Publish/subscribe fan-out for [`OverlayEvent`]s
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every future event
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&OverlayEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Deliver an event to all subscribers
    pub fn publish(&self, event: OverlayEvent) {
        log::trace!("Publishing {:?}", event);

        // Snapshot so callbacks may subscribe without deadlocking
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
