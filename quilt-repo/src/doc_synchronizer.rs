//! Per-document sync protocol driver.
//!
//! One [`DocSynchronizer`] exists per document. It owns the sync state for
//! every peer that has ever communicated about the document, drives the
//! per-peer state machine, generates outbound protocol messages, applies
//! inbound ones to the document, and signals unavailability when every
//! known peer has confirmed it cannot provide the document.
//!
//! All of its state lives behind one async mutex and is only mutated with
//! the lock held; the lock is never held across a suspension point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use automerge::sync::{self, SyncDoc};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use quilt_types::{
    DocumentId, DocUnavailableMessage, PeerId, RepoMessage, RequestMessage, SyncMessage,
};

use crate::error::RepoError;
use crate::handle::{DocHandle, DocHandleEvent, HandleState, SYNC_STATES};

/// What the synchronizer believes about one peer's relationship to the
/// document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerDocState {
    /// Nothing known yet.
    Unknown,
    /// The peer has sent us heads, or we have sent heads to them.
    HasDoc,
    /// The peer has signaled it does not have the document.
    DocUnavailable,
    /// We asked the peer for the document because we have no copy.
    Requesting,
}

struct SyncInner {
    /// Currently active peers, in the order they joined.
    peers: Vec<PeerId>,
    peer_states: HashMap<PeerId, PeerDocState>,
    /// One sync state per peer ever seen. Survives peer removal so a
    /// reconnecting peer resumes where it left off.
    sync_states: HashMap<PeerId, sync::State>,
    /// Every peer we have ever sent to or received from.
    recognized_peers: HashSet<PeerId>,
    /// Messages that arrived before the document became available.
    pending: VecDeque<RepoMessage>,
    sync_started: bool,
}

impl SyncInner {
    fn set_peer_state(&mut self, peer: &PeerId, state: PeerDocState) {
        let previous = self.peer_states.insert(peer.clone(), state);
        if previous != Some(state) {
            tracing::debug!(peer_id = %peer, state = ?state, "peer document state");
        }
    }
}

/// Drives the sync protocol for one document against every known peer.
pub(crate) struct DocSynchronizer {
    document_id: DocumentId,
    local_peer_id: PeerId,
    handle: DocHandle,
    outbound: UnboundedSender<RepoMessage>,
    inner: Mutex<SyncInner>,
}

impl DocSynchronizer {
    /// Create a synchronizer bound to a handle and start its listeners.
    pub(crate) fn new(
        local_peer_id: PeerId,
        handle: DocHandle,
        outbound: UnboundedSender<RepoMessage>,
    ) -> Arc<Self> {
        let synchronizer = Arc::new(Self {
            document_id: *handle.document_id(),
            local_peer_id,
            handle,
            outbound,
            inner: Mutex::new(SyncInner {
                peers: Vec::new(),
                peer_states: HashMap::new(),
                sync_states: HashMap::new(),
                recognized_peers: HashSet::new(),
                pending: VecDeque::new(),
                sync_started: false,
            }),
        });
        synchronizer.spawn_change_listener();
        synchronizer.spawn_pending_drain();
        synchronizer
    }

    /// The handle this synchronizer drives.
    pub(crate) fn handle(&self) -> &DocHandle {
        &self.handle
    }

    /// Start syncing with the given peers.
    ///
    /// Waits for the document to become available (loaded or requesting)
    /// before generating the first message to each peer.
    pub(crate) async fn begin_sync(&self, new_peers: Vec<PeerId>) {
        {
            let mut inner = self.inner.lock().await;
            inner.sync_started = true;
            for peer in &new_peers {
                if !inner.peers.contains(peer) {
                    inner.peers.push(peer.clone());
                }
                inner
                    .peer_states
                    .entry(peer.clone())
                    .or_insert(PeerDocState::Unknown);
                // Round-trip the retained sync state through its encoded
                // form. Decoding drops in-flight fields, which is what
                // breaks the infinite resend loop seen when a peer
                // disconnects mid-exchange.
                if let Some(state) = inner.sync_states.remove(peer) {
                    let reset = sync::State::decode(&state.encode())
                        .unwrap_or_else(|_| sync::State::new());
                    inner.sync_states.insert(peer.clone(), reset);
                }
            }
        }

        let state = self
            .handle
            .wait_for_states(&[
                HandleState::Ready,
                HandleState::Requesting,
                HandleState::Deleted,
            ])
            .await;
        if !matches!(state, HandleState::Ready | HandleState::Requesting) {
            return;
        }

        let mut inner = self.inner.lock().await;
        for peer in new_peers {
            // The peer may have left while we waited on the handle.
            if !inner.peers.contains(&peer) {
                continue;
            }
            self.send_sync_message(&mut inner, &peer);
        }
        self.check_unavailability(&mut inner);
    }

    /// Stop syncing with a peer.
    ///
    /// The peer's sync state is retained for reconnection and its document
    /// state stays in the unavailability calculation.
    pub(crate) async fn end_sync(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().await;
        inner.peers.retain(|p| p != peer);
        tracing::debug!(document_id = %self.document_id, peer_id = %peer, "peer left sync");
    }

    /// Handle an inbound protocol message.
    ///
    /// Messages that arrive before the document is available are buffered
    /// and drained, in arrival order, once the handle becomes ready or
    /// requesting.
    pub(crate) async fn receive_message(&self, message: RepoMessage) -> Result<(), RepoError> {
        if message.document_id() != &self.document_id {
            return Err(RepoError::ProtocolViolation(format!(
                "message for document {} delivered to synchronizer for {}",
                message.document_id(),
                self.document_id
            )));
        }

        let mut inner = self.inner.lock().await;
        inner.recognized_peers.insert(message.sender_id().clone());

        if !self.handle.in_state(SYNC_STATES) {
            tracing::debug!(
                document_id = %self.document_id,
                kind = message.kind(),
                "buffering message until document is available"
            );
            inner.pending.push_back(message);
            return Ok(());
        }

        // Anything still buffered is older than this message.
        while let Some(queued) = inner.pending.pop_front() {
            self.process(&mut inner, queued);
        }
        self.process(&mut inner, message);
        Ok(())
    }

    /// Generate a fresh sync message for every active peer.
    ///
    /// Called whenever the document changes.
    pub(crate) async fn sync_with_peers(&self) {
        if !self.handle.in_state(SYNC_STATES) {
            return;
        }
        let mut inner = self.inner.lock().await;
        let peers = inner.peers.clone();
        for peer in peers {
            self.send_sync_message(&mut inner, &peer);
        }
    }

    /// The peers currently being synced with.
    pub(crate) async fn active_peers(&self) -> Vec<PeerId> {
        self.inner.lock().await.peers.clone()
    }

    fn spawn_change_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut events = self.handle.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DocHandleEvent::Change) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(synchronizer) = weak.upgrade() else {
                            break;
                        };
                        synchronizer.sync_with_peers().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_pending_drain(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            handle
                .wait_for_states(&[
                    HandleState::Ready,
                    HandleState::Requesting,
                    HandleState::Deleted,
                ])
                .await;
            if let Some(synchronizer) = weak.upgrade() {
                synchronizer.drain_pending().await;
            }
        });
    }

    async fn drain_pending(&self) {
        if !self.handle.in_state(SYNC_STATES) {
            return;
        }
        let mut inner = self.inner.lock().await;
        while let Some(queued) = inner.pending.pop_front() {
            self.process(&mut inner, queued);
        }
    }

    fn process(&self, inner: &mut SyncInner, message: RepoMessage) {
        tracing::debug!(
            document_id = %self.document_id,
            sender_id = %message.sender_id(),
            kind = message.kind(),
            "processing message"
        );
        match message {
            RepoMessage::Sync(m) => {
                self.apply_sync_payload(inner, m.sender_id, m.data, false);
            }
            RepoMessage::Request(m) => {
                self.apply_sync_payload(inner, m.sender_id, m.data, true);
            }
            RepoMessage::DocUnavailable(m) => {
                inner.set_peer_state(&m.sender_id, PeerDocState::DocUnavailable);
                self.check_unavailability(inner);
            }
            RepoMessage::Ephemeral(m) => {
                self.handle.emit_ephemeral(m.sender_id, m.data);
            }
        }
    }

    fn apply_sync_payload(
        &self,
        inner: &mut SyncInner,
        sender: PeerId,
        data: Vec<u8>,
        is_request: bool,
    ) {
        if is_request {
            // A request tells us the sender has no copy of the document.
            inner.set_peer_state(&sender, PeerDocState::DocUnavailable);
        }

        let decoded = match sync::Message::decode(&data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    document_id = %self.document_id,
                    sender_id = %sender,
                    error = %e,
                    "dropping malformed sync message"
                );
                return;
            }
        };
        if !decoded.heads.is_empty() {
            inner.set_peer_state(&sender, PeerDocState::HasDoc);
        }

        let mut state = inner
            .sync_states
            .remove(&sender)
            .unwrap_or_else(sync::State::new);
        match self
            .handle
            .update(|doc| doc.receive_sync_message(&mut state, decoded))
        {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::warn!(
                    document_id = %self.document_id,
                    sender_id = %sender,
                    error = %e,
                    "failed to apply sync message"
                );
            }
            None => {
                tracing::warn!(
                    document_id = %self.document_id,
                    "no document to apply sync message to"
                );
            }
        }
        inner.sync_states.insert(sender.clone(), state);

        // Respond to this sender only; fan-out to other peers happens via
        // the handle's change event.
        self.send_sync_message(inner, &sender);
        self.check_unavailability(inner);
    }

    /// Generate and emit one sync message towards `peer`.
    fn send_sync_message(&self, inner: &mut SyncInner, peer: &PeerId) {
        let mut state = inner
            .sync_states
            .remove(peer)
            .unwrap_or_else(sync::State::new);
        let generated = self
            .handle
            .with_document_mut(|doc| doc.generate_sync_message(&mut state));
        let Some(message) = generated.flatten() else {
            inner.sync_states.insert(peer.clone(), state);
            return;
        };

        let heads = message.heads.clone();
        // A request rather than a sync: we hold nothing, share nothing
        // with this peer, know nobody who has the document, and have never
        // exchanged a message with this peer.
        let is_request = heads.is_empty()
            && state.shared_heads.is_empty()
            && !inner
                .peer_states
                .values()
                .any(|s| *s == PeerDocState::HasDoc)
            && !inner.recognized_peers.contains(peer)
            && matches!(
                inner.peer_states.get(peer),
                None | Some(PeerDocState::Unknown)
            );
        inner.sync_states.insert(peer.clone(), state);

        let data = message.encode();
        let outbound = if is_request {
            RepoMessage::Request(RequestMessage {
                sender_id: self.local_peer_id.clone(),
                target_id: peer.clone(),
                document_id: self.document_id,
                data,
            })
        } else {
            RepoMessage::Sync(SyncMessage {
                sender_id: self.local_peer_id.clone(),
                target_id: peer.clone(),
                document_id: self.document_id,
                data,
            })
        };
        tracing::debug!(
            document_id = %self.document_id,
            target_id = %peer,
            kind = outbound.kind(),
            "sending message"
        );
        let _ = self.outbound.send(outbound);

        if !heads.is_empty() {
            inner.set_peer_state(peer, PeerDocState::HasDoc);
        } else if is_request {
            inner.set_peer_state(peer, PeerDocState::Requesting);
        }
        inner.recognized_peers.insert(peer.clone());
    }

    /// The only path to an unavailable handle: sync has started, we are
    /// still requesting, and every active peer has said it cannot help.
    fn check_unavailability(&self, inner: &mut SyncInner) {
        if !inner.sync_started
            || !self.handle.in_state(&[HandleState::Requesting])
            || inner.peers.is_empty()
        {
            return;
        }
        let all_unavailable = inner
            .peers
            .iter()
            .all(|p| inner.peer_states.get(p) == Some(&PeerDocState::DocUnavailable));
        if !all_unavailable {
            return;
        }

        tracing::info!(document_id = %self.document_id, "document unavailable from all peers");
        for peer in inner.peers.clone() {
            let _ = self
                .outbound
                .send(RepoMessage::DocUnavailable(DocUnavailableMessage {
                    sender_id: self.local_peer_id.clone(),
                    target_id: peer,
                    document_id: self.document_id,
                }));
        }
        self.handle.unavailable();
    }

    #[cfg(test)]
    pub(crate) async fn peer_state(&self, peer: &PeerId) -> Option<PeerDocState> {
        self.inner.lock().await.peer_states.get(peer).copied()
    }

    #[cfg(test)]
    pub(crate) async fn is_recognized(&self, peer: &PeerId) -> bool {
        self.inner.lock().await.recognized_peers.contains(peer)
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}
