//! One reconciliation of one entity type with one peer
//!
//! The session only tracks state; the engine performs the network round
//! trips and feeds their results in phase by phase.

use super::{EntityKind, SyncEntity, SyncError};
use crate::crypto::MerkleTree;
use crate::network::message::PeerId;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Session phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPhase {
    TreeConstruction = 1,
    RootExchange = 2,
    IdExchange = 3,
    MissingDetection = 4,
    EntityFetch = 5,
    AttachmentTransfer = 6,
}

#[derive(Debug)]
pub struct SyncSession {
    peer_id: PeerId,
    kind: EntityKind,
    phase: SyncPhase,
    local_tree: MerkleTree,
    remote_root: Option<String>,
    local_ids: BTreeSet<String>,
    missing: Vec<String>,
    started_at: Instant,
}

impl SyncSession {
    /// Phase 1: build the local tree from the current collection
    pub fn start(
        peer_id: PeerId,
        kind: EntityKind,
        local: &[SyncEntity],
    ) -> Result<Self, SyncError> {
        let leaves = local
            .iter()
            .map(|e| Ok((e.id.clone(), e.content_hash()?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        Ok(Self {
            peer_id,
            kind,
            phase: SyncPhase::TreeConstruction,
            local_tree: MerkleTree::build(leaves),
            remote_root: None,
            local_ids: local.iter().map(|e| e.id.clone()).collect(),
            missing: Vec::new(),
            started_at: Instant::now(),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn local_root(&self) -> String {
        self.local_tree.root_hash()
    }

    pub fn remote_root(&self) -> Option<&str> {
        self.remote_root.as_deref()
    }

    pub fn local_count(&self) -> usize {
        self.local_tree.len()
    }

    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn advance(&mut self, from: SyncPhase, to: SyncPhase) -> Result<(), SyncError> {
        if self.phase != from {
            return Err(SyncError::OutOfOrder {
                expected: from,
                actual: self.phase,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Phase 2: compare roots. `true` means both sides already hold the
    /// same collection and the session can end here.
    pub fn compare_root(&mut self, remote_root: String) -> Result<bool, SyncError> {
        self.advance(SyncPhase::TreeConstruction, SyncPhase::RootExchange)?;
        let in_sync = remote_root == self.local_root();
        self.remote_root = Some(remote_root);
        Ok(in_sync)
    }

    /// Phases 3 and 4: take the remote id list and work out which ids are
    /// absent locally.
    ///
    /// Only absence is detected. An id both sides hold with different
    /// content is left alone even though it keeps the roots apart.
    pub fn receive_remote_ids(&mut self, remote_ids: Vec<String>) -> Result<&[String], SyncError> {
        self.advance(SyncPhase::RootExchange, SyncPhase::IdExchange)?;
        let remote: BTreeSet<String> = remote_ids.into_iter().collect();

        self.advance(SyncPhase::IdExchange, SyncPhase::MissingDetection)?;
        self.missing = remote.difference(&self.local_ids).cloned().collect();
        Ok(&self.missing)
    }

    /// Phase 5
    pub fn begin_fetch(&mut self) -> Result<(), SyncError> {
        self.advance(SyncPhase::MissingDetection, SyncPhase::EntityFetch)
    }

    /// Record an entity fetched and persisted during phase 5
    pub fn record_fetched(&mut self, id: &str) {
        self.local_ids.insert(id.to_string());
    }

    /// Phase 6
    pub fn begin_attachments(&mut self) -> Result<(), SyncError> {
        self.advance(SyncPhase::EntityFetch, SyncPhase::AttachmentTransfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entities(ids: &[&str]) -> Vec<SyncEntity> {
        ids.iter()
            .map(|id| SyncEntity::new(*id, json!({"name": format!("user {}", id)})))
            .collect()
    }

    #[test]
    fn test_matching_roots_end_early() {
        let local = entities(&["1", "2", "3"]);
        let remote = SyncSession::start(PeerId::new(), EntityKind::User, &local).unwrap();

        let mut session = SyncSession::start(PeerId::new(), EntityKind::User, &local).unwrap();
        assert_eq!(session.phase(), SyncPhase::TreeConstruction);
        assert!(session.compare_root(remote.local_root()).unwrap());
        assert_eq!(session.phase(), SyncPhase::RootExchange);
    }

    #[test]
    fn test_missing_ids() {
        let local = entities(&["1", "2", "3"]);
        let remote = entities(&["1", "2", "3", "4"]);
        let remote_root = SyncSession::start(PeerId::new(), EntityKind::User, &remote)
            .unwrap()
            .local_root();

        let mut session = SyncSession::start(PeerId::new(), EntityKind::User, &local).unwrap();
        assert!(!session.compare_root(remote_root).unwrap());

        let ids = remote.iter().map(|e| e.id.clone()).collect();
        assert_eq!(session.receive_remote_ids(ids).unwrap(), ["4".to_string()]);
        assert_eq!(session.phase(), SyncPhase::MissingDetection);

        session.begin_fetch().unwrap();
        session.record_fetched("4");
        session.begin_attachments().unwrap();
        assert_eq!(session.phase(), SyncPhase::AttachmentTransfer);
    }

    #[test]
    fn test_content_divergence_is_not_missing() {
        let local = vec![SyncEntity::new("1", json!({"name": "old"}))];
        let remote = vec![SyncEntity::new("1", json!({"name": "new"}))];
        let remote_root = SyncSession::start(PeerId::new(), EntityKind::User, &remote)
            .unwrap()
            .local_root();

        let mut session = SyncSession::start(PeerId::new(), EntityKind::User, &local).unwrap();
        assert!(!session.compare_root(remote_root).unwrap());
        assert!(session
            .receive_remote_ids(vec!["1".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_empty_collection() {
        let session = SyncSession::start(PeerId::new(), EntityKind::File, &[]).unwrap();
        assert_eq!(session.local_root(), crate::crypto::EMPTY_ROOT);
        assert_eq!(session.local_count(), 0);
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        let mut session = SyncSession::start(PeerId::new(), EntityKind::User, &[]).unwrap();
        assert!(matches!(
            session.begin_fetch(),
            Err(SyncError::OutOfOrder {
                expected: SyncPhase::MissingDetection,
                actual: SyncPhase::TreeConstruction
            })
        ));
    }
}
