//! Repo-wide message demux and peer fan-out.
//!
//! One [`CollectionSynchronizer`] exists per repo. It tracks the connected
//! peer set, creates [`DocSynchronizer`]s on demand, routes inbound
//! messages to the right one, and fans peer arrivals and departures out to
//! every document after consulting the share policy.
//!
//! The backlink to the repo is weak: the repo owns this synchronizer, and
//! handle lookups go through the repo by id rather than by holding it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use quilt_types::{DocumentId, PeerId, RepoMessage};

use crate::doc_synchronizer::DocSynchronizer;
use crate::error::RepoError;
use crate::repo::RepoInner;
use crate::share_policy::SharePolicy;

struct CollectionInner {
    /// Peers the repo is currently connected to.
    peers: HashSet<PeerId>,
    doc_synchronizers: HashMap<DocumentId, Arc<DocSynchronizer>>,
    /// Documents already announced to peers.
    doc_set_up: HashSet<DocumentId>,
}

/// Demultiplexes sync traffic for every document in a repo.
pub(crate) struct CollectionSynchronizer {
    local_peer_id: PeerId,
    repo: Weak<RepoInner>,
    share_policy: Arc<dyn SharePolicy>,
    outbound: UnboundedSender<RepoMessage>,
    inner: Mutex<CollectionInner>,
}

impl CollectionSynchronizer {
    pub(crate) fn new(
        local_peer_id: PeerId,
        repo: Weak<RepoInner>,
        share_policy: Arc<dyn SharePolicy>,
        outbound: UnboundedSender<RepoMessage>,
    ) -> Self {
        Self {
            local_peer_id,
            repo,
            share_policy,
            outbound,
            inner: Mutex::new(CollectionInner {
                peers: HashSet::new(),
                doc_synchronizers: HashMap::new(),
                doc_set_up: HashSet::new(),
            }),
        }
    }

    /// A peer connected: offer it every document the policy allows.
    ///
    /// Policy checks and the resulting syncs run concurrently per
    /// document; each document's own lock serializes its transitions.
    pub(crate) async fn add_peer(&self, peer_id: PeerId) {
        let documents = {
            let mut inner = self.inner.lock().await;
            if !inner.peers.insert(peer_id.clone()) {
                return;
            }
            inner
                .doc_synchronizers
                .iter()
                .map(|(id, sync)| (*id, sync.clone()))
                .collect::<Vec<_>>()
        };
        tracing::info!(peer_id = %peer_id, "peer joined");

        for (document_id, synchronizer) in documents {
            let policy = self.share_policy.clone();
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                if policy.should_share(&peer_id, Some(&document_id)).await {
                    synchronizer.begin_sync(vec![peer_id]).await;
                }
            });
        }
    }

    /// A peer disconnected: stop syncing every document with it.
    pub(crate) async fn remove_peer(&self, peer_id: &PeerId) {
        let synchronizers = {
            let mut inner = self.inner.lock().await;
            if !inner.peers.remove(peer_id) {
                return;
            }
            inner.doc_synchronizers.values().cloned().collect::<Vec<_>>()
        };
        tracing::info!(peer_id = %peer_id, "peer left");

        for synchronizer in synchronizers {
            synchronizer.end_sync(peer_id).await;
        }
    }

    /// Announce a document to the peers the policy is generous towards.
    pub(crate) async fn add_document(&self, document_id: DocumentId) {
        let (synchronizer, peers) = {
            let mut inner = self.inner.lock().await;
            if !inner.doc_set_up.insert(document_id) {
                return;
            }
            let Some(synchronizer) = self.fetch_or_create(&mut inner, document_id) else {
                return;
            };
            (synchronizer, inner.peers.iter().cloned().collect::<Vec<_>>())
        };

        let mut generous = Vec::new();
        for peer in peers {
            if self
                .share_policy
                .should_share(&peer, Some(&document_id))
                .await
            {
                generous.push(peer);
            }
        }
        if !generous.is_empty() {
            synchronizer.begin_sync(generous).await;
        }
    }

    /// Route an inbound message to its document's synchronizer, creating
    /// one (and thereby a handle) on first contact.
    pub(crate) async fn receive_message(&self, message: RepoMessage) -> Result<(), RepoError> {
        let document_id = *message.document_id();
        let (synchronizer, peers) = {
            let mut inner = self.inner.lock().await;
            inner.doc_set_up.insert(document_id);
            let Some(synchronizer) = self.fetch_or_create(&mut inner, document_id) else {
                tracing::debug!(document_id = %document_id, "repo gone; dropping message");
                return Ok(());
            };
            (synchronizer, inner.peers.iter().cloned().collect::<Vec<_>>())
        };

        synchronizer.receive_message(message).await?;

        // Any connected peer the synchronizer does not track yet may be
        // owed an announcement of this document.
        let tracked = synchronizer.active_peers().await;
        let candidates: Vec<PeerId> = peers
            .into_iter()
            .filter(|peer| !tracked.contains(peer))
            .collect();
        if !candidates.is_empty() {
            let policy = self.share_policy.clone();
            tokio::spawn(async move {
                let mut generous = Vec::new();
                for peer in candidates {
                    if policy.should_share(&peer, Some(&document_id)).await {
                        generous.push(peer);
                    }
                }
                if !generous.is_empty() {
                    synchronizer.begin_sync(generous).await;
                }
            });
        }
        Ok(())
    }

    /// Look up or create the synchronizer for a document.
    ///
    /// Creation materializes the document's handle through the repo, which
    /// wires storage loading and fires the repo's document event. Returns
    /// `None` only when the owning repo is gone.
    fn fetch_or_create(
        &self,
        inner: &mut CollectionInner,
        document_id: DocumentId,
    ) -> Option<Arc<DocSynchronizer>> {
        if let Some(synchronizer) = inner.doc_synchronizers.get(&document_id) {
            return Some(synchronizer.clone());
        }
        let repo = self.repo.upgrade()?;
        let handle = repo.find_or_create_handle(document_id);
        let synchronizer =
            DocSynchronizer::new(self.local_peer_id.clone(), handle, self.outbound.clone());
        inner
            .doc_synchronizers
            .insert(document_id, synchronizer.clone());
        Some(synchronizer)
    }
}
