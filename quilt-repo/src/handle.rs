//! Per-document handles and their lifecycle.
//!
//! A [`DocHandle`] is the client-facing reference to one synchronized
//! document. It carries a lifecycle state machine and the in-memory
//! automerge value; the synchronizer and the repo drive transitions, and
//! everyone observes them through a watch channel.

use std::sync::{Arc, Mutex};

use automerge::{Automerge, ChangeHash};
use tokio::sync::{broadcast, watch};

use quilt_types::{format_document_url, DocumentId, PeerId};

/// Lifecycle states of a document handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Constructed but not yet wired to storage or network.
    Idle,
    /// A storage load is in flight.
    Loading,
    /// The document must be fetched from peers.
    Requesting,
    /// The document is materialized and usable.
    Ready,
    /// Every known peer confirmed it cannot provide the document.
    Unavailable,
    /// Explicitly deleted.
    Deleted,
}

/// The states in which the synchronizer may process messages for a handle.
pub(crate) const SYNC_STATES: &[HandleState] = &[HandleState::Ready, HandleState::Requesting];

/// Events emitted by a [`DocHandle`].
#[derive(Debug, Clone)]
pub enum DocHandleEvent {
    /// The document changed, locally or from a remote sync message.
    Change,
    /// The document's heads moved; the new state is persistable.
    HeadsChanged,
    /// The handle transitioned to [`HandleState::Unavailable`].
    Unavailable,
    /// The handle was deleted.
    Deleted,
    /// An ephemeral payload arrived for this document.
    Ephemeral {
        /// The peer that sent the payload.
        sender_id: PeerId,
        /// Opaque application bytes.
        data: Vec<u8>,
    },
}

struct HandleInner {
    document_id: DocumentId,
    is_new: bool,
    doc: Mutex<Option<Automerge>>,
    state_tx: watch::Sender<HandleState>,
    events_tx: broadcast::Sender<DocHandleEvent>,
}

/// A reference to one synchronized document.
///
/// Clones share the same underlying document and state; a repo hands out
/// clones of the single handle it caches per document id.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

impl DocHandle {
    fn with_parts(document_id: DocumentId, is_new: bool, doc: Option<Automerge>, state: HandleState) -> Self {
        let (state_tx, _) = watch::channel(state);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(HandleInner {
                document_id,
                is_new,
                doc: Mutex::new(doc),
                state_tx,
                events_tx,
            }),
        }
    }

    /// A handle awaiting storage/network wiring.
    pub(crate) fn new(document_id: DocumentId, is_new: bool) -> Self {
        Self::with_parts(document_id, is_new, None, HandleState::Idle)
    }

    /// A handle that is ready from the start (freshly created documents).
    pub(crate) fn new_ready(document_id: DocumentId, doc: Automerge) -> Self {
        Self::with_parts(document_id, true, Some(doc), HandleState::Ready)
    }

    /// The document's identity.
    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    /// The document's external URL form.
    pub fn url(&self) -> String {
        format_document_url(&self.inner.document_id)
    }

    /// Whether this handle was created fresh rather than found.
    pub fn is_new(&self) -> bool {
        self.inner.is_new
    }

    /// The current lifecycle state.
    pub fn state(&self) -> HandleState {
        *self.inner.state_tx.borrow()
    }

    /// Whether the handle is currently in one of `states`.
    pub fn in_state(&self, states: &[HandleState]) -> bool {
        states.contains(&self.state())
    }

    /// Resolve once the handle enters one of `allowed`.
    ///
    /// This is how the synchronizer blocks on a storage load without
    /// holding any lock across the wait.
    pub async fn wait_for_states(&self, allowed: &[HandleState]) -> HandleState {
        let mut rx = self.inner.state_tx.subscribe();
        let result = match rx.wait_for(|state| allowed.contains(state)).await {
            Ok(state) => *state,
            // The sender lives in this handle, so this arm is unreachable
            // while the caller holds it.
            Err(_) => self.state(),
        };
        result
    }

    /// Subscribe to this handle's events.
    pub fn subscribe(&self) -> broadcast::Receiver<DocHandleEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Read the document, if materialized.
    pub fn with_document<R>(&self, f: impl FnOnce(&Automerge) -> R) -> Option<R> {
        let guard = self.inner.doc.lock().unwrap();
        guard.as_ref().map(f)
    }

    /// Mutate the document without change tracking.
    ///
    /// For serialization bookkeeping (`save_incremental` and friends) and
    /// sync-message generation; content mutations go through [`update`]
    /// so events fire.
    ///
    /// [`update`]: DocHandle::update
    pub(crate) fn with_document_mut<R>(&self, f: impl FnOnce(&mut Automerge) -> R) -> Option<R> {
        let mut guard = self.inner.doc.lock().unwrap();
        guard.as_mut().map(f)
    }

    /// Atomically mutate the document, emitting `Change` and
    /// `HeadsChanged` if the mutation moved the document's heads.
    ///
    /// A mutation that brings a requesting document past empty completes
    /// the request: the handle transitions to `Ready`.
    ///
    /// Returns `None` if the handle holds no document.
    pub fn update<R>(&self, f: impl FnOnce(&mut Automerge) -> R) -> Option<R> {
        let (result, heads_moved, now_nonempty) = {
            let mut guard = self.inner.doc.lock().unwrap();
            let doc = guard.as_mut()?;
            let before = doc.get_heads();
            let result = f(doc);
            let after = doc.get_heads();
            (result, before != after, !after.is_empty())
        };
        if heads_moved {
            if now_nonempty && self.transition(&[HandleState::Requesting], HandleState::Ready) {
                tracing::debug!(document_id = %self.inner.document_id, "requested document arrived");
            }
            self.emit(DocHandleEvent::Change);
            self.emit(DocHandleEvent::HeadsChanged);
        }
        Some(result)
    }

    /// The document's current heads, if materialized.
    pub fn heads(&self) -> Option<Vec<ChangeHash>> {
        self.with_document(|doc| doc.get_heads())
    }

    /// Idle → Loading, when a storage load is kicked off.
    pub(crate) fn begin_loading(&self) {
        self.transition(&[HandleState::Idle], HandleState::Loading);
    }

    /// Loading → Ready, installing the loaded document.
    pub(crate) fn load_complete(&self, doc: Automerge) {
        {
            let mut guard = self.inner.doc.lock().unwrap();
            *guard = Some(doc);
        }
        if self.transition(
            &[HandleState::Idle, HandleState::Loading],
            HandleState::Ready,
        ) {
            self.emit(DocHandleEvent::Change);
            self.emit(DocHandleEvent::HeadsChanged);
        }
    }

    /// {Idle, Loading} → Requesting: storage had nothing, ask the network.
    ///
    /// Installs an empty document for the sync protocol to fill.
    pub(crate) fn request(&self) {
        {
            let mut guard = self.inner.doc.lock().unwrap();
            if guard.is_none() {
                *guard = Some(Automerge::new());
            }
        }
        self.transition(
            &[HandleState::Idle, HandleState::Loading],
            HandleState::Requesting,
        );
    }

    /// Requesting → Unavailable. Only the synchronizer's unavailability
    /// rule calls this.
    pub(crate) fn unavailable(&self) {
        if self.transition(&[HandleState::Requesting], HandleState::Unavailable) {
            self.emit(DocHandleEvent::Unavailable);
        }
    }

    /// Re-announce unavailability for a handle already in that state.
    pub(crate) fn reannounce_unavailable(&self) {
        if self.in_state(&[HandleState::Unavailable]) {
            self.emit(DocHandleEvent::Unavailable);
        }
    }

    /// {Ready, Requesting, Unavailable} → Deleted.
    pub(crate) fn mark_deleted(&self) {
        if self.transition(
            &[
                HandleState::Ready,
                HandleState::Requesting,
                HandleState::Unavailable,
            ],
            HandleState::Deleted,
        ) {
            let mut guard = self.inner.doc.lock().unwrap();
            *guard = None;
            drop(guard);
            self.emit(DocHandleEvent::Deleted);
        }
    }

    /// Deliver an ephemeral payload to subscribers.
    pub(crate) fn emit_ephemeral(&self, sender_id: PeerId, data: Vec<u8>) {
        self.emit(DocHandleEvent::Ephemeral { sender_id, data });
    }

    /// Apply a transition if the current state is in `from`.
    ///
    /// Invalid transitions are no-ops, keeping the lifecycle monotone.
    fn transition(&self, from: &[HandleState], to: HandleState) -> bool {
        let moved = self.inner.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(document_id = %self.inner.document_id, state = ?to, "handle transition");
        }
        moved
    }

    fn emit(&self, event: DocHandleEvent) {
        // No subscribers is fine; events are observational.
        let _ = self.inner.events_tx.send(event);
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("document_id", &self.inner.document_id)
            .field("state", &self.state())
            .finish()
    }
}
