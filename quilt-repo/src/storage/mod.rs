//! Storage layer for Quilt.
//!
//! Persistence backends plug in behind [`StorageAdapter`], a small
//! key-value capability over hierarchical keys. The engine never talks to
//! an adapter directly; [`StorageCoordinator`](coordinator::StorageCoordinator)
//! handles document serialization and the key layout.

mod coordinator;
mod fs;
mod memory;

pub use coordinator::StorageCoordinator;
pub use fs::FsStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use quilt_types::{DocumentId, PeerId};
use std::fmt;
use thiserror::Error;

/// Errors produced by storage adapters and the coordinator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failed.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// Persisted document data could not be folded back into a document.
    #[error("stored document data is corrupt: {0}")]
    Corrupt(String),
}

/// A hierarchical storage key: an ordered sequence of short strings.
///
/// Range operations treat a key as a prefix componentwise: `[a]` is a
/// prefix of `[a, b]` but not of `[ab]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    /// Build a key from components.
    pub fn new(components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(components.into_iter().map(Into::into).collect())
    }

    /// The key prefix covering everything stored for one document.
    pub fn document_prefix(id: &DocumentId) -> Self {
        Self(vec![id.to_string()])
    }

    /// Append a component, returning the extended key.
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.0.push(component.into());
        self
    }

    /// The key components in order.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` is a componentwise prefix of this key.
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({})", self)
    }
}

/// One entry returned by a range load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// The full key the data is stored under.
    pub key: StorageKey,
    /// The stored bytes.
    pub data: Vec<u8>,
}

/// Capability trait for persistence backends.
///
/// Contracts: `save` then `load` of the same key returns the saved bytes
/// exactly; `save` over an existing key overwrites; `load_range(prefix)`
/// returns exactly the entries whose key starts with the prefix
/// componentwise, and `remove_range(prefix)` removes exactly those.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Load the bytes stored under `key`, if any.
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `data` under `key`, overwriting any previous value.
    async fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError>;

    /// Remove the entry under `key`. Removing a missing key is a no-op.
    async fn remove(&self, key: &StorageKey) -> Result<(), StorageError>;

    /// Load every entry whose key starts with `prefix` componentwise.
    async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<StoredChunk>, StorageError>;

    /// Remove every entry whose key starts with `prefix` componentwise.
    async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError>;
}

/// Key for a per-(document, peer) sync state entry.
pub(crate) fn sync_state_key(id: &DocumentId, peer: &PeerId) -> StorageKey {
    StorageKey::new([id.to_string(), "sync-state".to_string(), peer.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn componentwise_prefix_is_not_string_prefix() {
        let key = StorageKey::new(["ab", "c"]);
        assert!(key.starts_with(&StorageKey::new(["ab"])));
        assert!(!key.starts_with(&StorageKey::new(["a"])));
    }

    #[test]
    fn key_is_a_prefix_of_itself() {
        let key = StorageKey::new(["doc", "incremental", "deadbeef"]);
        assert!(key.starts_with(&key.clone()));
    }

    #[test]
    fn longer_key_is_not_a_prefix() {
        let short = StorageKey::new(["doc"]);
        let long = StorageKey::new(["doc", "snapshot"]);
        assert!(!short.starts_with(&long));
    }

    #[test]
    fn with_component_extends() {
        let key = StorageKey::document_prefix(&DocumentId::random()).with_component("incremental");
        assert_eq!(key.components().len(), 2);
        assert_eq!(key.components()[1], "incremental");
    }

    #[test]
    fn display_joins_components() {
        let key = StorageKey::new(["a", "b", "c"]);
        assert_eq!(key.to_string(), "a/b/c");
    }
}
