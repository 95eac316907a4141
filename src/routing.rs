//! Location-transparent request routing
//!
//! A client may talk to any node. When a request targets a user hosted
//! elsewhere, [`RoutingHelper::route_if_remote`] wraps it in a
//! retransmission envelope and forwards it to the owning peer, which runs it
//! through its own handlers and answers for it.
//!
//! Forwarded requests carry the already-routed flag. Anything carrying that
//! flag is processed where it lands, so a request makes at most one hop.

use crate::network::message::{
    is_already_routed, Action, PeerId, RequestEnvelope, ResponseEnvelope, RetransmissionEnvelope,
};
use crate::network::router::{HandlerError, MessageRouter};
use crate::sync::{EntityKind, EntityStore, StoreError};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Where a user lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLocation {
    pub user_id: String,
    /// Peer hosting the user
    pub peer_id: PeerId,
    /// Whether the user currently has a client session
    pub conectado: bool,
}

/// Local knowledge of which peer hosts which user
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn locate(&self, user_id: &str) -> Result<Option<UserLocation>, StoreError>;
}

/// Reads user ownership off synchronized USER entities: `peerId` names the
/// hosting peer and `conectado` the session flag
pub struct EntityUserDirectory {
    store: Arc<dyn EntityStore>,
}

impl EntityUserDirectory {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UserDirectory for EntityUserDirectory {
    async fn locate(&self, user_id: &str) -> Result<Option<UserLocation>, StoreError> {
        let Some(user) = self.store.get(EntityKind::User, user_id).await? else {
            return Ok(None);
        };

        let peer_id = user
            .data
            .get("peerId")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<PeerId>().ok());

        Ok(peer_id.map(|peer_id| UserLocation {
            user_id: user_id.to_string(),
            peer_id,
            conectado: user
                .data
                .get("conectado")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocatePayload {
    user_id: String,
}

pub struct RoutingHelper {
    router: Arc<MessageRouter>,
    users: Arc<dyn UserDirectory>,
    timeout: Duration,
}

impl RoutingHelper {
    pub fn new(router: Arc<MessageRouter>, users: Arc<dyn UserDirectory>, timeout: Duration) -> Self {
        Self {
            router,
            users,
            timeout,
        }
    }

    fn local_id(&self) -> PeerId {
        self.router.pool().local().peer_id
    }

    /// Forward a request to the peer hosting `target_user_id`.
    ///
    /// Returns `None` when the request should be handled here: the user is
    /// local, or the payload was already routed once. Otherwise returns the
    /// owning peer's response, or an error response when the user cannot be
    /// found or its peer cannot be reached.
    pub async fn route_if_remote(
        &self,
        target_user_id: &str,
        action: impl Into<Action>,
        payload: Value,
    ) -> Option<ResponseEnvelope> {
        let action = action.into();
        if is_already_routed(&payload) {
            return None;
        }

        let Some(location) = self.locate(target_user_id).await else {
            log::warn!("User {} not found anywhere in the network", target_user_id);
            return Some(ResponseEnvelope::error(
                action,
                format!("user {} not found in the network", target_user_id),
            ));
        };

        if location.peer_id == self.local_id() {
            return None;
        }

        let owner = location.peer_id;
        let envelope = RetransmissionEnvelope::wrap(self.router.pool().local(), owner, action.clone(), payload);
        let request = match serde_json::to_value(&envelope) {
            Ok(value) => RequestEnvelope::new(Action::Retransmit, value),
            Err(e) => return Some(ResponseEnvelope::error(action, format!("internal error: {}", e))),
        };

        log::debug!("Routing '{}' for user {} to {}", action, target_user_id, owner);
        match self.router.request(&owner, request, self.timeout).await {
            Ok(response) => Some(response),
            Err(e) => {
                log::warn!("Routing '{}' to {} failed: {}", action, owner, e);
                Some(ResponseEnvelope::error(
                    action,
                    format!("could not route to peer {}: {}", owner, e),
                ))
            }
        }
    }

    /// Find the peer hosting a user: local directory first, then every
    /// connected peer
    pub async fn locate(&self, user_id: &str) -> Option<UserLocation> {
        match self.users.locate(user_id).await {
            Ok(Some(location)) => return Some(location),
            Ok(None) => {}
            Err(e) => log::warn!("Local lookup of user {} failed: {}", user_id, e),
        }
        self.locate_remote(user_id).await
    }

    /// Ask every connected peer at once; the first positive answer wins
    async fn locate_remote(&self, user_id: &str) -> Option<UserLocation> {
        let peers = self.router.pool().connected_peers().await;
        let mut queries: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer_id| {
                let request = RequestEnvelope::new(Action::LocateUser, json!({ "userId": user_id }));
                async move { (peer_id, self.router.request(&peer_id, request, self.timeout).await) }
            })
            .collect();

        while let Some((peer_id, result)) = queries.next().await {
            match result.map(ResponseEnvelope::into_data) {
                Ok(Ok(data)) => match serde_json::from_value::<UserLocation>(data) {
                    Ok(location) => return Some(location),
                    Err(e) => log::warn!("Bad locate_user answer from {}: {}", peer_id, e),
                },
                Ok(Err(_)) => {}
                Err(e) => log::debug!("locate_user to {} failed: {}", peer_id, e),
            }
        }
        None
    }

    /// Serve `locate_user` and `retransmitirpeticion`
    pub async fn register_handlers(self: &Arc<Self>) {
        let users = self.users.clone();
        self.router
            .register_request_handler(Action::LocateUser, move |request: RequestEnvelope, _origin: PeerId| {
                let users = users.clone();
                async move {
                    let LocatePayload { user_id } = serde_json::from_value(request.payload)?;
                    match users.locate(&user_id).await? {
                        Some(location) => Ok::<_, HandlerError>(
                            ResponseEnvelope::success(Action::LocateUser, "user located")
                                .with_data(serde_json::to_value(location)?),
                        ),
                        None => Ok(ResponseEnvelope::error(
                            Action::LocateUser,
                            format!("user {} not hosted here", user_id),
                        )),
                    }
                }
            })
            .await;

        let router = Arc::downgrade(&self.router);
        let local_id = self.local_id();
        self.router
            .register_request_handler(Action::Retransmit, move |request: RequestEnvelope, origin: PeerId| {
                let router = router.clone();
                async move {
                    let router = router
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("router stopped"))?;
                    let envelope: RetransmissionEnvelope = serde_json::from_value(request.payload)?;

                    if envelope.peer_destino_id != local_id {
                        log::warn!(
                            "Refusing retransmission from {} addressed to {}",
                            origin,
                            envelope.peer_destino_id
                        );
                        return Ok(ResponseEnvelope::error(
                            Action::Retransmit,
                            format!("retransmission addressed to {}", envelope.peer_destino_id),
                        ));
                    }

                    log::debug!(
                        "Retransmitted '{}' from {} ({})",
                        envelope.peticion_cliente.action,
                        envelope.peer_origen.nombre_servidor,
                        origin
                    );
                    Ok::<_, HandlerError>(router.handle_local(envelope.into_request(), origin).await)
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::testing::{link, test_peer, TestPeer};
    use crate::sync::{MemoryEntityStore, SyncEntity};

    struct RoutingPeer {
        peer: TestPeer,
        store: Arc<MemoryEntityStore>,
        routing: Arc<RoutingHelper>,
    }

    async fn routing_peer(network: &MemoryNetwork, port: u16) -> RoutingPeer {
        let peer = test_peer(network, port).await;
        let store = Arc::new(MemoryEntityStore::new());
        let users = Arc::new(EntityUserDirectory::new(store.clone()));
        let routing = Arc::new(RoutingHelper::new(peer.router.clone(), users, Duration::from_secs(2)));
        routing.register_handlers().await;

        // Application action: echo the payload back with the handling peer
        let me = peer.id();
        peer.router
            .register_request_handler("send_direct", move |request: RequestEnvelope, _origin: PeerId| async move {
                Ok::<_, HandlerError>(
                    ResponseEnvelope::success("send_direct", "delivered")
                        .with_data(json!({ "handledBy": me, "payload": request.payload })),
                )
            })
            .await;

        RoutingPeer { peer, store, routing }
    }

    async fn add_user(store: &MemoryEntityStore, user_id: &str, owner: PeerId) {
        store
            .save(
                EntityKind::User,
                SyncEntity::new(user_id, json!({ "peerId": owner, "conectado": true })),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_user_is_not_routed() {
        let network = MemoryNetwork::new();
        let a = routing_peer(&network, 1).await;
        add_user(&a.store, "alice", a.peer.id()).await;

        assert!(a
            .routing
            .route_if_remote("alice", "send_direct", json!({ "text": "hi" }))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_remote_user_is_forwarded_once() {
        let network = MemoryNetwork::new();
        let a = routing_peer(&network, 1).await;
        let b = routing_peer(&network, 2).await;
        add_user(&a.store, "bob", b.peer.id()).await;
        link(&a.peer, &b.peer).await;

        let response = a
            .routing
            .route_if_remote("bob", "send_direct", json!({ "text": "hi" }))
            .await
            .expect("routed");
        assert!(response.is_success());

        let data = response.into_data().unwrap();
        assert_eq!(data["handledBy"], json!(b.peer.id()));
        assert_eq!(data["payload"]["text"], "hi");
        assert_eq!(data["payload"]["_yaEnrutado"], true);
        assert_eq!(data["payload"]["peerRemitenteId"], json!(a.peer.id()));
    }

    #[tokio::test]
    async fn test_already_routed_payload_stays_local() {
        let network = MemoryNetwork::new();
        let a = routing_peer(&network, 1).await;
        add_user(&a.store, "bob", PeerId::new()).await;

        assert!(a
            .routing
            .route_if_remote("bob", "send_direct", json!({ "_yaEnrutado": true }))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_network_lookup() {
        let network = MemoryNetwork::new();
        let a = routing_peer(&network, 1).await;
        let b = routing_peer(&network, 2).await;
        // Only b knows carol
        add_user(&b.store, "carol", b.peer.id()).await;
        link(&a.peer, &b.peer).await;

        let location = a.routing.locate("carol").await.unwrap();
        assert_eq!(location.peer_id, b.peer.id());
        assert!(location.conectado);

        let response = a
            .routing
            .route_if_remote("carol", "send_direct", json!({}))
            .await
            .unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_users() {
        let network = MemoryNetwork::new();
        let a = routing_peer(&network, 1).await;
        add_user(&a.store, "dave", PeerId::new()).await;

        let unknown = a
            .routing
            .route_if_remote("nobody", "send_direct", json!({}))
            .await
            .unwrap();
        assert!(!unknown.is_success());
        assert!(unknown.message.contains("not found"));

        let unreachable = a
            .routing
            .route_if_remote("dave", "send_direct", json!({}))
            .await
            .unwrap();
        assert!(!unreachable.is_success());
        assert_eq!(unreachable.action, Action::parse("send_direct"));
    }

    #[tokio::test]
    async fn test_misaddressed_retransmission_refused() {
        let network = MemoryNetwork::new();
        let a = routing_peer(&network, 1).await;
        let elsewhere = PeerId::new();

        let envelope = RetransmissionEnvelope::wrap(
            &crate::network::message::PeerDescriptor::new(PeerId::new(), "10.0.0.3", 22200, "gamma"),
            elsewhere,
            Action::parse("send_direct"),
            json!({}),
        );
        let request = RequestEnvelope::new(Action::Retransmit, serde_json::to_value(envelope).unwrap());
        let response = a.peer.router.handle_local(request, PeerId::new()).await;
        assert!(!response.is_success());
    }
}
