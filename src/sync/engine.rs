//! Sync engine
//!
//! Runs [`SyncSession`]s against connected peers and answers the sync
//! requests peers send us. At most one session per (peer, entity type) runs
//! at a time; a failure aborts that session only.

use super::session::SyncSession;
use super::store::{AttachmentStore, EntityStore, SyncEntity};
use super::{EntityKind, SyncError};
use crate::config::OverlayConfig;
use crate::crypto::MerkleTree;
use crate::events::{EventBus, OverlayEvent};
use crate::network::maintenance::spawn_periodic;
use crate::network::message::{Action, PeerId, RequestEnvelope, ResponseEnvelope, MAX_FRAME_SIZE};
use crate::network::router::{HandlerError, MessageRouter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Largest attachment that still fits in one frame once base64-encoded
pub const MAX_ATTACHMENT_SIZE: usize = (MAX_FRAME_SIZE - 64 * 1024) / 4 * 3;

/// Engine timing
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout for each request of a session
    pub request_timeout: Duration,
    /// Pause between persisting entity metadata and fetching attachments
    pub attachment_delay: Duration,
    /// Period of the anti-entropy round over all connected peers
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            attachment_delay: Duration::from_millis(500),
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&OverlayConfig> for SyncConfig {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            request_timeout: config.client_timeout(),
            attachment_delay: config.attachment_delay(),
            interval: config.sync_interval(),
        }
    }
}

/// Result of one completed session
#[derive(Debug)]
pub struct SyncReport {
    pub peer_id: PeerId,
    pub kind: EntityKind,
    /// Roots matched; nothing past the root exchange ran
    pub in_sync: bool,
    /// Ids the peer had and we did not
    pub missing: Vec<String>,
    /// Ids fetched and persisted
    pub fetched: Vec<String>,
    /// Background attachment transfer, yielding the number of files written
    pub attachments: Option<JoinHandle<usize>>,
}

#[derive(Deserialize)]
struct KindPayload {
    tipo: EntityKind,
}

#[derive(Deserialize)]
struct EntityPayload {
    tipo: EntityKind,
    id: String,
}

#[derive(Deserialize)]
struct AttachmentPayload {
    path: String,
}

type ActiveSet = Arc<Mutex<HashSet<(PeerId, EntityKind)>>>;

/// Clears the (peer, kind) slot however the session ends
struct ActiveSession {
    active: ActiveSet,
    key: (PeerId, EntityKind),
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct SyncEngine {
    router: Arc<MessageRouter>,
    store: Arc<dyn EntityStore>,
    attachments: Arc<dyn AttachmentStore>,
    events: Arc<EventBus>,
    config: SyncConfig,
    active: ActiveSet,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        router: Arc<MessageRouter>,
        store: Arc<dyn EntityStore>,
        attachments: Arc<dyn AttachmentStore>,
        events: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            router,
            store,
            attachments,
            events,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            task: Mutex::new(None),
        }
    }

    /// Spawn the periodic anti-entropy round
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let this = self.clone();
        *task = Some(spawn_periodic("anti-entropy", self.config.interval, move || {
            let this = this.clone();
            async move {
                this.sync_connected().await;
            }
        }));
        log::info!("Anti-entropy started (every {:?})", self.config.interval);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Whether a session with this peer for this kind is running
    pub fn is_active(&self, peer_id: &PeerId, kind: EntityKind) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(*peer_id, kind))
    }

    fn begin(&self, peer_id: PeerId, kind: EntityKind) -> Result<ActiveSession, SyncError> {
        let key = (peer_id, kind);
        let inserted = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);

        if !inserted {
            return Err(SyncError::SessionActive { peer_id, kind });
        }
        Ok(ActiveSession {
            active: self.active.clone(),
            key,
        })
    }

    // ===== Client side =====

    /// Run a full sync against every connected peer, returning how many
    /// peers were visited
    pub async fn sync_connected(&self) -> usize {
        let peers = self.router.pool().connected_peers().await;
        for peer_id in &peers {
            let results = self.sync_all(*peer_id).await;
            let fetched: usize = results
                .iter()
                .filter_map(|(_, r)| r.as_ref().ok())
                .map(|report| report.fetched.len())
                .sum();
            if fetched > 0 {
                log::info!("Anti-entropy pulled {} entities from {}", fetched, peer_id);
            }
        }
        peers.len()
    }

    /// Synchronize every entity type with a peer, in dependency order.
    /// A failed type does not stop the following ones.
    pub async fn sync_all(&self, peer_id: PeerId) -> Vec<(EntityKind, Result<SyncReport, SyncError>)> {
        log::debug!("Starting full sync with {}", peer_id);
        let mut results = Vec::with_capacity(EntityKind::ORDER.len());
        for kind in EntityKind::ORDER {
            let result = self.sync_entity_type(peer_id, kind).await;
            if let Err(SyncError::SessionActive { .. }) = &result {
                log::debug!("Sync of {} with {} already running", kind, peer_id);
            }
            results.push((kind, result));
        }
        results
    }

    /// Reconcile one entity type with one peer
    pub async fn sync_entity_type(&self, peer_id: PeerId, kind: EntityKind) -> Result<SyncReport, SyncError> {
        let _session = self.begin(peer_id, kind)?;

        match self.run_session(peer_id, kind).await {
            Ok(report) => {
                self.events.publish(OverlayEvent::SyncCompleted {
                    peer_id,
                    kind,
                    fetched: report.fetched.len(),
                });
                Ok(report)
            }
            Err(e) => {
                log::warn!("Sync of {} with {} aborted: {}", kind, peer_id, e);
                self.events.publish(OverlayEvent::SyncAborted {
                    peer_id,
                    kind,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_session(&self, peer_id: PeerId, kind: EntityKind) -> Result<SyncReport, SyncError> {
        let local = self.store.list(kind).await?;
        let mut session = SyncSession::start(peer_id, kind, &local)?;

        let remote_root = self.fetch_root(&peer_id, kind).await?;
        if session.compare_root(remote_root)? {
            log::debug!("{} already in sync with {} ({} entities)", kind, peer_id, session.local_count());
            return Ok(SyncReport {
                peer_id,
                kind,
                in_sync: true,
                missing: Vec::new(),
                fetched: Vec::new(),
                attachments: None,
            });
        }

        let remote_ids = self.fetch_ids(&peer_id, kind).await?;
        let missing = session.receive_remote_ids(remote_ids)?.to_vec();
        log::info!("{} diverges from {}: {} missing locally", kind, peer_id, missing.len());

        session.begin_fetch()?;
        let mut fetched = Vec::with_capacity(missing.len());
        for id in &missing {
            let entity = self.fetch_entity(&peer_id, kind, id).await?;
            self.store.save(kind, entity).await?;
            session.record_fetched(id);
            fetched.push(id.clone());
        }

        session.begin_attachments()?;
        let attachments = self.schedule_attachments(peer_id, kind).await?;

        log::info!(
            "Synced {} with {}: fetched {} in {:?}",
            kind,
            peer_id,
            fetched.len(),
            session.elapsed()
        );

        Ok(SyncReport {
            peer_id,
            kind,
            in_sync: false,
            missing,
            fetched,
            attachments,
        })
    }

    async fn call(&self, peer_id: &PeerId, action: Action, payload: Value) -> Result<Value, SyncError> {
        let response = self
            .router
            .request(peer_id, RequestEnvelope::new(action, payload), self.config.request_timeout)
            .await?;
        response.into_data().map_err(SyncError::Remote)
    }

    async fn fetch_root(&self, peer_id: &PeerId, kind: EntityKind) -> Result<String, SyncError> {
        let data = self.call(peer_id, Action::SyncRootHash, json!({ "tipo": kind })).await?;
        data.get("hash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::InvalidResponse("root hash missing".into()))
    }

    async fn fetch_ids(&self, peer_id: &PeerId, kind: EntityKind) -> Result<Vec<String>, SyncError> {
        let data = self.call(peer_id, Action::SyncGetIds, json!({ "tipo": kind })).await?;
        let ids = data
            .get("ids")
            .cloned()
            .ok_or_else(|| SyncError::InvalidResponse("id list missing".into()))?;
        Ok(serde_json::from_value(ids)?)
    }

    async fn fetch_entity(&self, peer_id: &PeerId, kind: EntityKind, id: &str) -> Result<SyncEntity, SyncError> {
        let data = self
            .call(peer_id, Action::SyncGetEntity, json!({ "tipo": kind, "id": id }))
            .await?;
        let entity: SyncEntity = serde_json::from_value(
            data.get("data")
                .cloned()
                .ok_or_else(|| SyncError::InvalidResponse("entity missing".into()))?,
        )?;

        if entity.id != id {
            return Err(SyncError::InvalidResponse(format!(
                "asked for {}, got {}",
                id, entity.id
            )));
        }
        Ok(entity)
    }

    /// Spawn the delayed attachment transfer for every attachment the
    /// collection references
    async fn schedule_attachments(
        &self,
        peer_id: PeerId,
        kind: EntityKind,
    ) -> Result<Option<JoinHandle<usize>>, SyncError> {
        let mut paths = Vec::new();
        for entity in self.store.list(kind).await? {
            for path in self.store.attachment_refs(kind, &entity) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        if paths.is_empty() {
            return Ok(None);
        }

        let router = self.router.clone();
        let attachments = self.attachments.clone();
        let events = self.events.clone();
        let delay = self.config.attachment_delay;
        let timeout = self.config.request_timeout;

        Ok(Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut count = 0;
            for path in paths {
                match transfer_attachment(&router, attachments.as_ref(), &peer_id, &path, timeout).await {
                    Ok(true) => count += 1,
                    Ok(false) => {}
                    Err(e) => log::warn!("Attachment {} from {} failed: {}", path, peer_id, e),
                }
            }

            if count > 0 {
                log::info!("Fetched {} attachment(s) from {}", count, peer_id);
                events.publish(OverlayEvent::AttachmentsFetched { peer_id, count });
            }
            count
        })))
    }

    // ===== Server side =====

    /// Answer the sync requests of other peers
    pub async fn register_handlers(&self) {
        let store = self.store.clone();
        self.router
            .register_request_handler(Action::SyncRootHash, move |request: RequestEnvelope, _origin: PeerId| {
                let store = store.clone();
                async move { answer_root_hash(store.as_ref(), request).await }
            })
            .await;

        let store = self.store.clone();
        self.router
            .register_request_handler(Action::SyncGetIds, move |request: RequestEnvelope, _origin: PeerId| {
                let store = store.clone();
                async move { answer_ids(store.as_ref(), request).await }
            })
            .await;

        let store = self.store.clone();
        self.router
            .register_request_handler(Action::SyncGetEntity, move |request: RequestEnvelope, _origin: PeerId| {
                let store = store.clone();
                async move { answer_entity(store.as_ref(), request).await }
            })
            .await;

        let attachments = self.attachments.clone();
        self.router
            .register_request_handler(
                Action::SyncGetAttachment,
                move |request: RequestEnvelope, _origin: PeerId| {
                    let attachments = attachments.clone();
                    async move { answer_attachment(attachments.as_ref(), request).await }
                },
            )
            .await;
    }
}

/// Download one attachment unless it is already present
async fn transfer_attachment(
    router: &MessageRouter,
    attachments: &dyn AttachmentStore,
    peer_id: &PeerId,
    path: &str,
    timeout: Duration,
) -> Result<bool, SyncError> {
    if attachments.exists(path).await? {
        return Ok(false);
    }

    let request = RequestEnvelope::new(Action::SyncGetAttachment, json!({ "path": path }));
    let data = router
        .request(peer_id, request, timeout)
        .await?
        .into_data()
        .map_err(SyncError::Remote)?;

    let encoded = data
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidResponse("attachment content missing".into()))?;
    let content = BASE64
        .decode(encoded)
        .map_err(|e| SyncError::InvalidResponse(format!("bad attachment encoding: {}", e)))?;

    attachments.write(path, &content).await?;
    Ok(true)
}

async fn answer_root_hash(store: &dyn EntityStore, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
    let KindPayload { tipo } = serde_json::from_value(request.payload)?;

    let mut leaves = Vec::new();
    for entity in store.list(tipo).await? {
        let hash = entity.content_hash()?;
        leaves.push((entity.id, hash));
    }
    let tree = MerkleTree::build(leaves);

    Ok(ResponseEnvelope::success(Action::SyncRootHash, "root hash")
        .with_data(json!({ "tipo": tipo, "hash": tree.root_hash(), "count": tree.len() })))
}

async fn answer_ids(store: &dyn EntityStore, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
    let KindPayload { tipo } = serde_json::from_value(request.payload)?;
    let ids = store.ids(tipo).await?;
    Ok(ResponseEnvelope::success(Action::SyncGetIds, "ids").with_data(json!({ "tipo": tipo, "ids": ids })))
}

async fn answer_entity(store: &dyn EntityStore, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
    let EntityPayload { tipo, id } = serde_json::from_value(request.payload)?;
    match store.get(tipo, &id).await? {
        Some(entity) => Ok(ResponseEnvelope::success(Action::SyncGetEntity, "entity")
            .with_data(json!({ "tipo": tipo, "data": entity }))),
        None => Ok(ResponseEnvelope::error(
            Action::SyncGetEntity,
            format!("{} {} not found", tipo, id),
        )),
    }
}

async fn answer_attachment(
    attachments: &dyn AttachmentStore,
    request: RequestEnvelope,
) -> Result<ResponseEnvelope, HandlerError> {
    let AttachmentPayload { path } = serde_json::from_value(request.payload)?;
    let content = attachments.read(&path).await?;
    if content.len() > MAX_ATTACHMENT_SIZE {
        log::warn!("Attachment {} is {} bytes, too large to serve", path, content.len());
        return Ok(ResponseEnvelope::error(
            Action::SyncGetAttachment,
            format!("attachment {} too large ({} bytes)", path, content.len()),
        ));
    }
    Ok(ResponseEnvelope::success(Action::SyncGetAttachment, "attachment")
        .with_data(json!({ "path": path, "content": BASE64.encode(content) })))
}
