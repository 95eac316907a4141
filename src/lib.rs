//! Chat Overlay: a peer-to-peer overlay for chat servers
//!
//! Independent chat server instances use this crate to find each other,
//! stay connected, forward client requests to whichever server hosts the
//! target user, and converge their copies of shared data. It features:
//! - Handshake-keyed connection pool over TCP
//! - Heartbeat failure detection, reconnection and registry reconciliation
//! - Request/response routing with single-hop retransmission
//! - Peer discovery by directory exchange
//! - Merkle-tree anti-entropy sync of users, channels, members, messages
//!   and files, with attachment transfer
//!
//! # Example
//!
//! ```rust,no_run
//! use chat_overlay::config::OverlayConfig;
//! use chat_overlay::network::{Node, NodeServices};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OverlayConfig {
//!     port: 22200,
//!     bootstrap_peers: vec!["10.0.0.2:22200".to_string()],
//!     ..Default::default()
//! };
//!
//! let node = Node::tcp(config, NodeServices::in_memory()).await?;
//! node.start().await?;
//!
//! // Forward a request to the server hosting "bob", if that is not us
//! if let Some(response) = node
//!     .routing()
//!     .route_if_remote("bob", "send_message", serde_json::json!({"text": "hi"}))
//!     .await
//! {
//!     println!("Handled remotely: {}", response.message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod events;
pub mod network;
pub mod registry;
pub mod routing;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, OverlayConfig};
pub use events::{EventBus, OverlayEvent};
pub use network::{Action, Node, NodeServices, PeerDescriptor, PeerId, RequestEnvelope, ResponseEnvelope};
pub use registry::{PeerRecord, PeerRegistry, PeerState};
pub use routing::{RoutingHelper, UserDirectory, UserLocation};
pub use sync::{EntityKind, SyncEngine, SyncEntity};
