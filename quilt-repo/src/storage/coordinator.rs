//! Document serialization over a storage adapter.
//!
//! The coordinator owns the key layout:
//!
//! - `[documentId, "snapshot", <hash>]` - full document bytes
//! - `[documentId, "incremental", <hash>]` - incremental change chunks
//! - `[documentId, "sync-state", <peerId>]` - per-peer sync state
//!
//! Chunk ids are the SHA-256 of the chunk contents, so re-saving identical
//! bytes is idempotent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use automerge::Automerge;
use sha2::{Digest, Sha256};

use quilt_types::{DocumentId, PeerId};

use super::{sync_state_key, StorageAdapter, StorageError, StorageKey};
use crate::handle::DocHandle;

/// Every Nth nonempty save of a document also writes a full snapshot.
///
/// The cadence is a function of the save sequence alone, so two repos
/// replaying the same saves produce the same key set.
const SNAPSHOT_INTERVAL: u64 = 10;

const SNAPSHOT: &str = "snapshot";
const INCREMENTAL: &str = "incremental";

/// Serialization layer between the repo and a [`StorageAdapter`].
pub struct StorageCoordinator {
    adapter: Arc<dyn StorageAdapter>,
    saves: Mutex<HashMap<DocumentId, u64>>,
}

impl StorageCoordinator {
    /// Wrap a storage adapter.
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            saves: Mutex::new(HashMap::new()),
        }
    }

    /// Persist the changes made to a document since its last save.
    ///
    /// Writes one incremental chunk (nothing if the document is unchanged),
    /// plus a full snapshot on the deterministic cadence.
    pub async fn save_doc(
        &self,
        id: &DocumentId,
        handle: &DocHandle,
    ) -> Result<(), StorageError> {
        let Some(chunk) = handle.with_document_mut(|doc| doc.save_incremental()) else {
            return Ok(());
        };
        if chunk.is_empty() {
            return Ok(());
        }

        let key = chunk_key(id, INCREMENTAL, &chunk);
        self.adapter.save(&key, &chunk).await?;
        tracing::debug!(document_id = %id, key = %key, bytes = chunk.len(), "saved chunk");

        let snapshot_due = {
            let mut saves = self.saves.lock().unwrap();
            let count = saves.entry(*id).or_insert(0);
            *count += 1;
            *count % SNAPSHOT_INTERVAL == 0
        };
        if snapshot_due {
            if let Some(full) = handle.with_document_mut(|doc| doc.save()) {
                let key = chunk_key(id, SNAPSHOT, &full);
                self.adapter.save(&key, &full).await?;
                tracing::debug!(document_id = %id, key = %key, "saved snapshot");
            }
        }
        Ok(())
    }

    /// Persist a full snapshot of a freshly created document.
    pub async fn save_new_doc(
        &self,
        id: &DocumentId,
        handle: &DocHandle,
    ) -> Result<(), StorageError> {
        if let Some(full) = handle.with_document_mut(|doc| doc.save()) {
            let key = chunk_key(id, SNAPSHOT, &full);
            self.adapter.save(&key, &full).await?;
        }
        Ok(())
    }

    /// Load and fold every stored chunk for a document.
    ///
    /// Returns `None` when nothing is stored under the document's prefix.
    pub async fn load_doc(&self, id: &DocumentId) -> Result<Option<Automerge>, StorageError> {
        let chunks = self
            .adapter
            .load_range(&StorageKey::document_prefix(id))
            .await?;

        let kind_of = |key: &StorageKey| key.components().get(1).cloned().unwrap_or_default();
        let mut snapshots = Vec::new();
        let mut incrementals = Vec::new();
        for chunk in chunks {
            match kind_of(&chunk.key).as_str() {
                SNAPSHOT => snapshots.push(chunk.data),
                INCREMENTAL => incrementals.push(chunk.data),
                // sync-state entries and unknown kinds are not document data
                _ => {}
            }
        }
        if snapshots.is_empty() && incrementals.is_empty() {
            return Ok(None);
        }

        let mut doc = Automerge::new();
        for bytes in snapshots.iter().chain(incrementals.iter()) {
            doc.load_incremental(bytes)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        }
        Ok(Some(doc))
    }

    /// Remove every key stored for a document.
    pub async fn remove_doc(&self, id: &DocumentId) -> Result<(), StorageError> {
        self.saves.lock().unwrap().remove(id);
        self.adapter
            .remove_range(&StorageKey::document_prefix(id))
            .await
    }

    /// Persist a peer's sync state.
    ///
    /// Fast path for reconnection; the in-memory sync state is
    /// authoritative within a process and the sync loop never reads this
    /// back.
    pub async fn save_sync_state(
        &self,
        id: &DocumentId,
        peer: &PeerId,
        state: &automerge::sync::State,
    ) -> Result<(), StorageError> {
        self.adapter
            .save(&sync_state_key(id, peer), &state.encode())
            .await
    }

    /// Load a previously persisted sync state for a peer, if present.
    pub async fn load_sync_state(
        &self,
        id: &DocumentId,
        peer: &PeerId,
    ) -> Result<Option<automerge::sync::State>, StorageError> {
        let Some(bytes) = self.adapter.load(&sync_state_key(id, peer)).await? else {
            return Ok(None);
        };
        match automerge::sync::State::decode(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(document_id = %id, peer_id = %peer, error = %e,
                    "discarding undecodable sync state");
                Ok(None)
            }
        }
    }
}

fn chunk_key(id: &DocumentId, kind: &str, data: &[u8]) -> StorageKey {
    let digest = Sha256::digest(data);
    StorageKey::new([id.to_string(), kind.to_string(), hex::encode(digest)])
}
