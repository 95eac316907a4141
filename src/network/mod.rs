//! P2P networking module
//!
//! Provides the peer-to-peer plumbing of the overlay.
//!
//! # Features
//! - Length-prefixed JSON frames over TCP (or an in-process network)
//! - Handshake-keyed connection pool with bidirectional links
//! - Request/response routing with correlation ids
//! - Heartbeats, reconnection and registry reconciliation
//! - Directory exchange for peer discovery

pub mod discovery;
pub mod maintenance;
pub mod memory;
pub mod message;
pub mod node;
pub mod pool;
pub mod router;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use discovery::{DiscoveryReport, PeerDiscovery};
pub use maintenance::{MaintenanceConfig, MaintenanceScheduler, ReconcileReport, SweepReport};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{
    Action, Frame, HeartbeatPayload, MessageError, PeerDescriptor, PeerId, RequestEnvelope, ResponseEnvelope,
    RetransmissionEnvelope, Status, ALREADY_ROUTED_KEY, MAGIC, MAX_FRAME_SIZE,
};
pub use node::{Node, NodeError, NodeServices, NodeStatus};
pub use pool::{ConnectionInfo, ConnectionPool, PeerError, PoolConfig};
pub use router::{HandlerError, MessageRouter, RequestHandler, ResponseHandler, RouterError};
pub use transport::{check_frame_size, Direction, TcpTransport, Transport, TransportError, TransportEvent};
