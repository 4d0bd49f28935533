//! # quilt-repo
//!
//! A peer-to-peer synchronization engine for [automerge] documents.
//!
//! A [`Repo`] owns a cache of [`DocHandle`]s, one per document. Behind
//! every handle sits a per-document synchronizer that drives the automerge
//! sync protocol against each connected peer, deciding when to offer a
//! document, when to request it, and when to declare it unavailable.
//! Storage and network backends plug in behind the [`StorageAdapter`] and
//! [`NetworkAdapter`] capability traits.
//!
//! ```ignore
//! use quilt_repo::{MemoryNetwork, Repo, RepoConfig};
//! use std::sync::Arc;
//!
//! let alice = Repo::new(RepoConfig::new("alice"));
//! let bob = Repo::new(RepoConfig::new("bob"));
//!
//! let (alice_end, bob_end) = MemoryNetwork::pair("alice".into(), "bob".into());
//! alice.add_network_adapter(Arc::new(alice_end));
//! bob.add_network_adapter(Arc::new(bob_end));
//!
//! let handle = alice.create();
//! handle.update(|doc| { /* edit via automerge transactions */ });
//! // bob.find(&handle.url()) now converges on alice's content
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod collection_synchronizer;
mod doc_synchronizer;
mod error;
mod handle;
mod network;
mod repo;
mod share_policy;
mod storage;

pub use error::RepoError;
pub use handle::{DocHandle, DocHandleEvent, HandleState};
pub use network::{
    MemoryNetwork, MemoryNetworkAdapter, NetworkAdapter, NetworkError, NetworkEvent,
};
pub use repo::{Repo, RepoConfig, RepoEvent};
pub use share_policy::{ShareAll, ShareNone, SharePolicy};
pub use storage::{
    FsStorage, MemoryStorage, StorageAdapter, StorageCoordinator, StorageError, StorageKey,
    StoredChunk,
};

pub use quilt_types::{
    format_document_url, parse_document_url, DocumentId, PeerId, RepoMessage, UrlError,
};

// Re-exported so applications edit documents with the same automerge the
// engine links against.
pub use automerge;
