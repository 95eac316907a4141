//! Persistence boundaries for synchronized data
//!
//! [`EntityStore`] holds entity metadata per type; [`AttachmentStore`] holds
//! the binary content some entities point to.

use super::EntityKind;
use crate::crypto::content_hash;
use crate::network::router::HandlerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid attachment path: {0}")]
    InvalidPath(String),
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// One synchronized entity: an opaque id plus its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntity {
    pub id: String,
    pub data: Value,
}

impl SyncEntity {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self { id: id.into(), data }
    }

    /// Hash of the entity content, independent of JSON key order
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        content_hash(self)
    }
}

/// Field naming an attachment on any entity
pub const ATTACHMENT_FIELD: &str = "attachment";

/// Field naming the stored content of a FILE entity
pub const FILE_PATH_FIELD: &str = "path";

/// Entity collections, one per [`EntityKind`]
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn list(&self, kind: EntityKind) -> Result<Vec<SyncEntity>, StoreError>;

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<SyncEntity>, StoreError>;

    /// Insert or overwrite an entity
    async fn save(&self, kind: EntityKind, entity: SyncEntity) -> Result<(), StoreError>;

    async fn ids(&self, kind: EntityKind) -> Result<Vec<String>, StoreError> {
        Ok(self.list(kind).await?.into_iter().map(|e| e.id).collect())
    }

    /// Attachment paths an entity refers to
    fn attachment_refs(&self, kind: EntityKind, entity: &SyncEntity) -> Vec<String> {
        let mut refs = Vec::new();
        if kind == EntityKind::File {
            if let Some(path) = entity.data.get(FILE_PATH_FIELD).and_then(Value::as_str) {
                refs.push(path.to_string());
            }
        }
        if let Some(path) = entity.data.get(ATTACHMENT_FIELD).and_then(Value::as_str) {
            if !refs.iter().any(|r| r == path) {
                refs.push(path.to_string());
            }
        }
        refs
    }
}

/// In-memory entity store
#[derive(Default)]
pub struct MemoryEntityStore {
    collections: RwLock<HashMap<EntityKind, BTreeMap<String, SyncEntity>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with entities of one kind
    pub async fn with_entities(kind: EntityKind, entities: impl IntoIterator<Item = SyncEntity>) -> Self {
        let store = Self::new();
        {
            let mut collections = store.collections.write().await;
            let collection = collections.entry(kind).or_default();
            for entity in entities {
                collection.insert(entity.id.clone(), entity);
            }
        }
        store
    }

    pub async fn len(&self, kind: EntityKind) -> usize {
        self.collections
            .read()
            .await
            .get(&kind)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn list(&self, kind: EntityKind) -> Result<Vec<SyncEntity>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(&kind)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<SyncEntity>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(&kind)
            .and_then(|c| c.get(id).cloned()))
    }

    async fn save(&self, kind: EntityKind, entity: SyncEntity) -> Result<(), StoreError> {
        self.collections
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(entity.id.clone(), entity);
        Ok(())
    }
}

/// Binary attachment storage keyed by relative path
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), StoreError>;
}

/// Attachments kept under a root directory
pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

        if !safe {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(full).await?)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to temporary file first
        let temp = part_path(&full);
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &full).await?;
        Ok(())
    }
}

/// Temporary sibling of `full`, unique per file name
fn part_path(full: &Path) -> PathBuf {
    let mut name = full.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    full.with_file_name(name)
}

/// In-memory attachment store
#[derive(Default)]
pub struct MemoryAttachmentStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.files.read().await.contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        self.files
            .write()
            .await
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }
}
