//! The repo: composition root for handles, sync, storage, and network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use automerge::Automerge;
use tokio::sync::broadcast;
use tokio::sync::mpsc::unbounded_channel;

use quilt_types::{parse_document_url, DocumentId, PeerId};

use crate::collection_synchronizer::CollectionSynchronizer;
use crate::error::RepoError;
use crate::handle::{DocHandle, DocHandleEvent, HandleState};
use crate::network::{NetworkAdapter, NetworkError, NetworkEvent, NetworkSubsystem};
use crate::share_policy::{ShareAll, SharePolicy};
use crate::storage::{StorageAdapter, StorageCoordinator};

/// Configuration for a [`Repo`].
pub struct RepoConfig {
    peer_id: PeerId,
    storage: Option<Arc<dyn StorageAdapter>>,
    share_policy: Arc<dyn SharePolicy>,
}

impl RepoConfig {
    /// A repo with the given identity, no storage, and the generous share
    /// policy.
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            storage: None,
            share_policy: Arc::new(ShareAll),
        }
    }

    /// Persist documents through the given adapter.
    pub fn with_storage(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(adapter);
        self
    }

    /// Replace the generous default share policy.
    pub fn with_share_policy(mut self, policy: Arc<dyn SharePolicy>) -> Self {
        self.share_policy = policy;
        self
    }
}

/// Events a repo emits about its document collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoEvent {
    /// A document entered the repo (created locally, found, or announced
    /// by a peer).
    DocumentAdded(DocumentId),
    /// A document was explicitly deleted.
    DocumentDeleted(DocumentId),
    /// A requested document was declared unavailable by every known peer.
    UnavailableDocument(DocumentId),
}

pub(crate) struct RepoInner {
    peer_id: PeerId,
    handles: Mutex<HashMap<DocumentId, DocHandle>>,
    storage: Option<Arc<StorageCoordinator>>,
    network: NetworkSubsystem,
    collection: Arc<CollectionSynchronizer>,
    events_tx: broadcast::Sender<RepoEvent>,
}

/// A collection of synchronized documents.
///
/// The repo owns the handle cache (one handle per document id), wires
/// storage around handle lifecycles, and registers every document with its
/// collection synchronizer so peers hear about it.
pub struct Repo {
    inner: Arc<RepoInner>,
}

impl Repo {
    /// Build a repo from configuration and start its outbound pump.
    pub fn new(config: RepoConfig) -> Self {
        let (outbound_tx, mut outbound_rx) = unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let peer_id = config.peer_id.clone();

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<RepoInner>| RepoInner {
            peer_id: peer_id.clone(),
            handles: Mutex::new(HashMap::new()),
            storage: config
                .storage
                .map(|adapter| Arc::new(StorageCoordinator::new(adapter))),
            network: NetworkSubsystem::new(),
            collection: Arc::new(CollectionSynchronizer::new(
                peer_id,
                weak.clone(),
                config.share_policy,
                outbound_tx,
            )),
            events_tx,
        });

        // Outbound pump: every message any synchronizer emits goes to the
        // network subsystem for routing. Holding the repo weakly lets the
        // pump die with it.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.network.send(message).await;
            }
        });

        Self { inner }
    }

    /// This repo's identity on the network.
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// Subscribe to repo events.
    pub fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Register a network adapter and start consuming its events.
    pub fn add_network_adapter(&self, adapter: Arc<dyn NetworkAdapter>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_adapter(weak, adapter));
    }

    /// Create a new document. The handle is ready immediately.
    pub fn create(&self) -> DocHandle {
        self.create_with_doc(Automerge::new())
    }

    /// Create a new document from an already-ready source document.
    ///
    /// Fails with [`RepoError::CloneNotReady`] unless the source handle is
    /// ready.
    pub fn clone_document(&self, source: &DocHandle) -> Result<DocHandle, RepoError> {
        if !source.in_state(&[HandleState::Ready]) {
            return Err(RepoError::CloneNotReady);
        }
        let forked = source
            .with_document_mut(|doc| doc.fork())
            .ok_or(RepoError::CloneNotReady)?;
        Ok(self.create_with_doc(forked))
    }

    fn create_with_doc(&self, doc: Automerge) -> DocHandle {
        let document_id = DocumentId::random();
        let handle = DocHandle::new_ready(document_id, doc);
        self.inner
            .handles
            .lock()
            .unwrap()
            .insert(document_id, handle.clone());
        tracing::info!(document_id = %document_id, "created document");

        // New documents are persisted immediately so a crash before the
        // first edit still leaves a loadable record.
        if let Some(storage) = &self.inner.storage {
            let storage = storage.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = storage.save_new_doc(handle.document_id(), &handle).await {
                    tracing::warn!(error = %e, "initial save failed");
                }
            });
        }
        self.inner.wire_handle(&handle);
        handle
    }

    /// Look up a document by URL.
    ///
    /// Returns the cached handle if the repo already knows the document;
    /// otherwise constructs one, loading from storage when configured and
    /// requesting from peers when the load comes up empty. Storage
    /// failures during this explicit load propagate to the caller.
    pub async fn find(&self, url: &str) -> Result<DocHandle, RepoError> {
        let document_id = parse_document_url(url)?;
        self.find_by_id(document_id).await
    }

    /// [`find`](Repo::find) by raw document id.
    pub async fn find_by_id(&self, document_id: DocumentId) -> Result<DocHandle, RepoError> {
        let (handle, created) = self.inner.lookup_or_insert(document_id);
        if !created {
            // Late joiners to an unavailable document still hear about it.
            if handle.in_state(&[HandleState::Unavailable]) {
                let inner = self.inner.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle.reannounce_unavailable();
                    inner.emit(RepoEvent::UnavailableDocument(*handle.document_id()));
                });
            }
            return Ok(handle);
        }

        match &self.inner.storage {
            Some(storage) => {
                handle.begin_loading();
                match storage.load_doc(&document_id).await {
                    Ok(Some(doc)) => handle.load_complete(doc),
                    Ok(None) => self.inner.request_when_network_ready(&handle),
                    Err(e) => {
                        // Nothing observed this handle yet; forget it so a
                        // retry starts clean.
                        self.inner.handles.lock().unwrap().remove(&document_id);
                        return Err(e.into());
                    }
                }
            }
            None => self.inner.request_when_network_ready(&handle),
        }
        self.inner.wire_handle(&handle);
        Ok(handle)
    }

    /// Drop a document: remove its handle, delete its storage, and tell
    /// subscribers. Removal is not propagated to peers.
    pub fn delete(&self, document_id: &DocumentId) {
        let handle = self.inner.handles.lock().unwrap().remove(document_id);
        if let Some(handle) = handle {
            handle.mark_deleted();
        }
        tracing::info!(document_id = %document_id, "deleted document");
        self.inner.emit(RepoEvent::DocumentDeleted(*document_id));

        if let Some(storage) = &self.inner.storage {
            let storage = storage.clone();
            let document_id = *document_id;
            tokio::spawn(async move {
                if let Err(e) = storage.remove_doc(&document_id).await {
                    tracing::warn!(document_id = %document_id, error = %e, "storage removal failed");
                }
            });
        }
    }

    /// Persist any unsaved state of every cached document.
    ///
    /// Saves otherwise happen in the background on change events; call
    /// this before shutting down.
    pub async fn flush(&self) -> Result<(), RepoError> {
        let Some(storage) = &self.inner.storage else {
            return Ok(());
        };
        let handles: Vec<(DocumentId, DocHandle)> = {
            let handles = self.inner.handles.lock().unwrap();
            handles.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        for (document_id, handle) in handles {
            storage.save_doc(&document_id, &handle).await?;
        }
        Ok(())
    }
}

impl RepoInner {
    fn emit(&self, event: RepoEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Cache lookup, inserting a fresh unloaded handle on miss.
    fn lookup_or_insert(&self, document_id: DocumentId) -> (DocHandle, bool) {
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get(&document_id) {
            return (handle.clone(), false);
        }
        let handle = DocHandle::new(document_id, false);
        handles.insert(document_id, handle.clone());
        (handle, true)
    }

    /// Materialize a handle for the collection synchronizer.
    ///
    /// Unlike [`Repo::find_by_id`] the storage load runs in the
    /// background: this is called from the message path, which must not
    /// wait on storage.
    pub(crate) fn find_or_create_handle(self: &Arc<Self>, document_id: DocumentId) -> DocHandle {
        let (handle, created) = self.lookup_or_insert(document_id);
        if !created {
            return handle;
        }
        self.wire_handle(&handle);

        match &self.storage {
            Some(storage) => {
                handle.begin_loading();
                let storage = storage.clone();
                let handle = handle.clone();
                tokio::spawn({
                    let ready = self.network.ready_receiver();
                    async move {
                        match storage.load_doc(handle.document_id()).await {
                            Ok(Some(doc)) => handle.load_complete(doc),
                            Ok(None) => request_on_ready(ready, handle).await,
                            Err(e) => {
                                // Background load; the message that caused
                                // this materialization still needs the
                                // handle, so fall back to requesting.
                                tracing::error!(error = %e, "storage load failed");
                                request_on_ready(ready, handle).await;
                            }
                        }
                    }
                });
            }
            None => self.request_when_network_ready(&handle),
        }
        handle
    }

    /// Shared post-creation wiring: announce the document, start the
    /// event listener, and register with the collection synchronizer.
    fn wire_handle(self: &Arc<Self>, handle: &DocHandle) {
        let document_id = *handle.document_id();
        self.emit(RepoEvent::DocumentAdded(document_id));

        let weak = Arc::downgrade(self);
        let mut events = handle.subscribe();
        let handle_clone = handle.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DocHandleEvent::HeadsChanged)
                    | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if let Some(storage) = &inner.storage {
                            if let Err(e) =
                                storage.save_doc(&document_id, &handle_clone).await
                            {
                                tracing::warn!(
                                    document_id = %document_id,
                                    error = %e,
                                    "background save failed"
                                );
                            }
                        }
                    }
                    Ok(DocHandleEvent::Unavailable) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.emit(RepoEvent::UnavailableDocument(document_id));
                    }
                    Ok(DocHandleEvent::Deleted) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            inner.collection.add_document(document_id).await;
        });
    }

    /// Transition a handle to requesting once some adapter reports ready.
    fn request_when_network_ready(&self, handle: &DocHandle) {
        let ready = self.network.ready_receiver();
        let handle = handle.clone();
        tokio::spawn(request_on_ready(ready, handle));
    }
}

async fn request_on_ready(mut ready: tokio::sync::watch::Receiver<bool>, handle: DocHandle) {
    if ready.wait_for(|ready| *ready).await.is_ok() {
        handle.request();
    }
}

/// Receive loop for one network adapter.
async fn run_adapter(
    weak: std::sync::Weak<RepoInner>,
    adapter: Arc<dyn NetworkAdapter>,
) {
    loop {
        let event = adapter.recv().await;
        let Some(inner) = weak.upgrade() else { break };
        match event {
            Ok(NetworkEvent::Ready) => inner.network.mark_ready(),
            Ok(NetworkEvent::PeerCandidate { peer_id }) => {
                if peer_id == inner.peer_id {
                    tracing::warn!(peer_id = %peer_id, "adapter announced our own id; ignoring");
                    continue;
                }
                if inner.network.add_route(peer_id.clone(), adapter.clone()) {
                    inner.collection.add_peer(peer_id).await;
                }
            }
            Ok(NetworkEvent::PeerDisconnected { peer_id }) => {
                if inner.network.remove_route(&peer_id) {
                    inner.collection.remove_peer(&peer_id).await;
                }
            }
            Ok(NetworkEvent::Message(message)) => {
                if let Err(e) = inner.collection.receive_message(message).await {
                    tracing::error!(error = %e, "dropping message");
                }
            }
            Err(NetworkError::Closed) => {
                for peer_id in inner.network.peers_via(&adapter) {
                    inner.network.remove_route(&peer_id);
                    inner.collection.remove_peer(&peer_id).await;
                }
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "network adapter failed");
                break;
            }
        }
    }
}
