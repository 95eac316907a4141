//! Message router
//!
//! Decodes frames into request/response envelopes and dispatches them to the
//! handlers registered for their action. Requests always get exactly one
//! response: the handler's, an "unsupported action" error, or an "internal
//! error" when the handler fails or panics. Responses either complete a
//! pending [`MessageRouter::request`] (matched by `requestId`) or go to the
//! response handler for their action; anything else is discarded.

use crate::network::message::{Action, Frame, PeerId, RequestEnvelope, ResponseEnvelope};
use crate::network::pool::{ConnectionPool, PeerError};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use uuid::Uuid;

/// Router errors
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("No response to '{action}' from {peer_id}")]
    Timeout { action: String, peer_id: PeerId },
    #[error("Request to {0} cancelled by disconnect")]
    Cancelled(PeerId),
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Error raised by a request handler; becomes an error response
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("invalid payload: {}", e))
    }
}

impl From<RouterError> for HandlerError {
    fn from(e: RouterError) -> Self {
        Self(e.to_string())
    }
}

/// Handles one request action
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: RequestEnvelope,
        origin: PeerId,
    ) -> Result<ResponseEnvelope, HandlerError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestEnvelope, PeerId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseEnvelope, HandlerError>> + Send,
{
    async fn handle(
        &self,
        request: RequestEnvelope,
        origin: PeerId,
    ) -> Result<ResponseEnvelope, HandlerError> {
        (self)(request, origin).await
    }
}

/// Handles responses nobody is waiting for
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: ResponseEnvelope, origin: PeerId);
}

#[async_trait]
impl<F, Fut> ResponseHandler for F
where
    F: Fn(ResponseEnvelope, PeerId) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, response: ResponseEnvelope, origin: PeerId) {
        (self)(response, origin).await
    }
}

struct PendingRequest {
    peer_id: PeerId,
    tx: oneshot::Sender<ResponseEnvelope>,
}

/// Routes frames between the connection pool and handlers
pub struct MessageRouter {
    pool: Arc<ConnectionPool>,
    request_handlers: RwLock<HashMap<Action, Arc<dyn RequestHandler>>>,
    response_handlers: RwLock<HashMap<Action, Arc<dyn ResponseHandler>>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl MessageRouter {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            request_handlers: RwLock::new(HashMap::new()),
            response_handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Register the handler for a request action, replacing any previous one
    pub async fn register_request_handler<H>(&self, action: impl Into<Action>, handler: H)
    where
        H: RequestHandler + 'static,
    {
        let action = action.into();
        log::debug!("Registered request handler for '{}'", action);
        self.request_handlers
            .write()
            .await
            .insert(action, Arc::new(handler));
    }

    /// Register the handler for unsolicited responses of an action
    pub async fn register_response_handler<H>(&self, action: impl Into<Action>, handler: H)
    where
        H: ResponseHandler + 'static,
    {
        let action = action.into();
        log::debug!("Registered response handler for '{}'", action);
        self.response_handlers
            .write()
            .await
            .insert(action, Arc::new(handler));
    }

    pub async fn has_request_handler(&self, action: &Action) -> bool {
        self.request_handlers.read().await.contains_key(action)
    }

    // ===== Inbound =====

    /// Handle one raw frame from a peer. Never fails: malformed frames are
    /// logged and dropped.
    pub async fn dispatch(&self, raw: &[u8], origin: PeerId) {
        match Frame::decode(raw) {
            Err(e) => {
                log::warn!("Dropping malformed frame from {}: {}", origin, e);
            }
            Ok(Frame::Request(request)) => {
                let action = request.action.clone();
                let request_id = request.request_id;
                log::trace!("Request '{}' from {}", action, origin);

                let response = self
                    .handle_local(request, origin)
                    .await
                    .with_request_id(request_id);

                if let Err(e) = self.respond(&origin, &response).await {
                    log::warn!("Failed to answer '{}' from {}: {}", action, origin, e);
                }
            }
            Ok(Frame::Response(response)) => {
                self.handle_response(response, origin).await;
            }
        }
    }

    /// Run a request through the local handler table and produce its response
    pub async fn handle_local(&self, request: RequestEnvelope, origin: PeerId) -> ResponseEnvelope {
        let action = request.action.clone();
        let handler = self.request_handlers.read().await.get(&action).cloned();

        let Some(handler) = handler else {
            log::warn!("No handler for action '{}' from {}", action, origin);
            return ResponseEnvelope::error(action.clone(), format!("unsupported action: {}", action));
        };

        match AssertUnwindSafe(handler.handle(request, origin))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::warn!("Handler for '{}' from {} failed: {}", action, origin, e);
                ResponseEnvelope::error(action, format!("internal error: {}", e))
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                log::error!("Handler for '{}' from {} panicked: {}", action, origin, message);
                ResponseEnvelope::error(action, format!("internal error: {}", message))
            }
        }
    }

    async fn handle_response(&self, response: ResponseEnvelope, origin: PeerId) {
        if let Some(request_id) = response.request_id {
            let mut pending = self.pending.lock().await;
            if pending.get(&request_id).is_some_and(|p| p.peer_id == origin) {
                if let Some(waiter) = pending.remove(&request_id) {
                    drop(pending);
                    if waiter.tx.send(response).is_err() {
                        log::debug!("Waiter for {} gone", request_id);
                    }
                    return;
                }
            }
        }

        let handler = self
            .response_handlers
            .read()
            .await
            .get(&response.action)
            .cloned();

        match handler {
            Some(handler) => {
                let action = response.action.clone();
                if AssertUnwindSafe(handler.handle(response, origin))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    log::error!("Response handler for '{}' panicked", action);
                }
            }
            None => {
                log::trace!("Ignoring unsolicited '{}' response from {}", response.action, origin);
            }
        }
    }

    // ===== Outbound =====

    /// Send a request and wait for the matching response
    pub async fn request(
        &self,
        peer_id: &PeerId,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, RouterError> {
        let request_id = Uuid::new_v4();
        let action = request.action.to_string();
        let request = request.with_request_id(request_id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id,
            PendingRequest {
                peer_id: *peer_id,
                tx,
            },
        );

        if let Err(e) = self.send_request(peer_id, &request).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RouterError::Cancelled(*peer_id)),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(RouterError::Timeout {
                    action,
                    peer_id: *peer_id,
                })
            }
        }
    }

    /// Fire-and-forget request to one peer
    pub async fn send_request(
        &self,
        peer_id: &PeerId,
        request: &RequestEnvelope,
    ) -> Result<(), RouterError> {
        self.pool.send(peer_id, request.to_bytes()?).await?;
        Ok(())
    }

    /// Fire-and-forget request to every connected peer
    pub async fn broadcast_request(&self, request: &RequestEnvelope) -> Result<usize, RouterError> {
        Ok(self.pool.broadcast(request.to_bytes()?).await)
    }

    async fn respond(&self, peer_id: &PeerId, response: &ResponseEnvelope) -> Result<(), RouterError> {
        self.pool.send(peer_id, response.to_bytes()?).await?;
        Ok(())
    }

    /// Fail every pending request addressed to a peer
    pub async fn cancel_peer(&self, peer_id: &PeerId) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.peer_id != *peer_id);
        let cancelled = before - pending.len();

        if cancelled > 0 {
            log::debug!("Cancelled {} pending request(s) to {}", cancelled, peer_id);
        }
        cancelled
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::message::Status;
    use crate::network::testing::test_peer;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn pair(base: u16) -> (Arc<MessageRouter>, Arc<MessageRouter>, PeerId) {
        let network = MemoryNetwork::new();
        let a = test_peer(&network, base).await.router;
        let b = test_peer(&network, base + 1).await.router;
        let b_id = a.pool().connect("127.0.0.1", base + 1).await.unwrap();
        (a, b, b_id)
    }

    fn timeout() -> Duration {
        Duration::from_secs(2)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (a, b, b_id) = pair(6001).await;

        b.register_request_handler("ECHO", |req: RequestEnvelope, _origin: PeerId| async move {
            Ok::<_, HandlerError>(ResponseEnvelope::success(req.action, "ok").with_data(req.payload))
        })
        .await;

        let response = a
            .request(&b_id, RequestEnvelope::new("echo", json!({"n": 7})), timeout())
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.data.unwrap()["n"], 7);
        assert_eq!(a.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsupported_action_yields_one_error() {
        let (a, _b, b_id) = pair(6011).await;

        let response = a
            .request(&b_id, RequestEnvelope::new("nonexistent", json!({})), timeout())
            .await
            .unwrap();

        assert_eq!(response.status, Status::Error);
        assert_eq!(response.action, Action::parse("nonexistent"));
        assert!(response.message.contains("nonexistent"));
    }

    #[tokio::test]
    async fn test_handler_failures_become_error_responses() {
        let (a, b, b_id) = pair(6021).await;

        b.register_request_handler("fails", |_req: RequestEnvelope, _origin: PeerId| async move {
            Err::<ResponseEnvelope, _>(HandlerError::new("database unavailable"))
        })
        .await;
        b.register_request_handler("panics", |_req: RequestEnvelope, _origin: PeerId| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, HandlerError>(ResponseEnvelope::success("panics", ""))
        })
        .await;

        let failed = a
            .request(&b_id, RequestEnvelope::new("fails", json!(null)), timeout())
            .await
            .unwrap();
        assert_eq!(failed.message, "internal error: database unavailable");

        let panicked = a
            .request(&b_id, RequestEnvelope::new("panics", json!(null)), timeout())
            .await
            .unwrap();
        assert_eq!(panicked.status, Status::Error);
        assert_eq!(panicked.message, "internal error: boom");

        // The link survives handler faults
        assert!(a.pool().is_connected(&b_id).await);
    }

    #[tokio::test]
    async fn test_unsolicited_responses() {
        let (a, b, b_id) = pair(6031).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        a.register_response_handler("notice", move |resp: ResponseEnvelope, origin: PeerId| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((resp.message, origin));
            }
        })
        .await;

        let a_id = a.pool().local().peer_id;
        while !b.pool().is_connected(&a_id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let ignored = ResponseEnvelope::success("unhandled", "dropped");
        let notice = ResponseEnvelope::success("NOTICE", "hello");
        b.pool().send(&a_id, ignored.to_bytes().unwrap()).await.unwrap();
        b.pool().send(&a_id, notice.to_bytes().unwrap()).await.unwrap();

        let (message, origin) = tokio::time::timeout(timeout(), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message, "hello");
        assert_eq!(origin, b_id);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (a, _b, b_id) = pair(6041).await;
        a.dispatch(b"{not json", b_id).await;
        a.dispatch(br#"{"something":"else"}"#, b_id).await;
        assert!(a.pool().is_connected(&b_id).await);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending() {
        let (a, b, b_id) = pair(6051).await;

        b.register_request_handler("slow", |req: RequestEnvelope, _origin: PeerId| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, HandlerError>(ResponseEnvelope::success(req.action, ""))
        })
        .await;

        let waiter = {
            let a = a.clone();
            tokio::spawn(async move {
                a.request(&b_id, RequestEnvelope::new("slow", json!(null)), Duration::from_secs(20))
                    .await
            })
        };

        while a.pending_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.cancel_peer(&b_id).await, 1);

        assert!(matches!(waiter.await.unwrap(), Err(RouterError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (a, b, b_id) = pair(6061).await;

        b.register_request_handler("slow", |req: RequestEnvelope, _origin: PeerId| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, HandlerError>(ResponseEnvelope::success(req.action, ""))
        })
        .await;

        let result = a
            .request(&b_id, RequestEnvelope::new("slow", json!(null)), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RouterError::Timeout { .. })));
        assert_eq!(a.pending_count().await, 0);
    }
}
