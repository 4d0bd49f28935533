//! In-process network adapter.
//!
//! [`MemoryNetwork::pair`] yields two connected endpoints, one per repo.
//! Each endpoint announces readiness and the remote peer as soon as it is
//! polled, so two repos wired this way discover each other without any
//! transport handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use quilt_types::{PeerId, RepoMessage};

use super::{NetworkAdapter, NetworkError, NetworkEvent};

/// Factory for connected in-process adapter pairs.
pub struct MemoryNetwork;

impl MemoryNetwork {
    /// Create a connected pair of adapters.
    ///
    /// The first endpoint belongs to the repo identified by `left`, the
    /// second to `right`; each announces the other as a peer candidate.
    pub fn pair(left: PeerId, right: PeerId) -> (MemoryNetworkAdapter, MemoryNetworkAdapter) {
        let (to_left, left_inbox) = unbounded_channel();
        let (to_right, right_inbox) = unbounded_channel();

        let left_end = MemoryNetworkAdapter::new(
            left.clone(),
            right.clone(),
            to_right.clone(),
            to_left.clone(),
            left_inbox,
        );
        let right_end = MemoryNetworkAdapter::new(right, left, to_left, to_right, right_inbox);
        (left_end, right_end)
    }
}

/// One endpoint of an in-process connection.
pub struct MemoryNetworkAdapter {
    local_id: PeerId,
    remote_id: PeerId,
    /// Delivers into the remote endpoint's inbox.
    outbound: UnboundedSender<NetworkEvent>,
    /// Delivers into our own inbox (seeding and close notification).
    self_tx: UnboundedSender<NetworkEvent>,
    inbox: Mutex<UnboundedReceiver<NetworkEvent>>,
    closed: Arc<AtomicBool>,
}

impl MemoryNetworkAdapter {
    fn new(
        local_id: PeerId,
        remote_id: PeerId,
        outbound: UnboundedSender<NetworkEvent>,
        self_tx: UnboundedSender<NetworkEvent>,
        inbox: UnboundedReceiver<NetworkEvent>,
    ) -> Self {
        // Seed the local repo's view: transport up, remote reachable.
        let _ = self_tx.send(NetworkEvent::Ready);
        let _ = self_tx.send(NetworkEvent::PeerCandidate {
            peer_id: remote_id.clone(),
        });
        Self {
            local_id,
            remote_id,
            outbound,
            self_tx,
            inbox: Mutex::new(inbox),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The peer on the other end of this connection.
    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }
}

#[async_trait]
impl NetworkAdapter for MemoryNetworkAdapter {
    async fn recv(&self) -> Result<NetworkEvent, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        let mut inbox = self.inbox.lock().await;
        let event = inbox.recv().await.ok_or(NetworkError::Closed)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        Ok(event)
    }

    async fn send(&self, message: RepoMessage) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        self.outbound
            .send(NetworkEvent::Message(message))
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.closed.store(true, Ordering::SeqCst);
        // Tell the remote side we are gone; if it is already dropped there
        // is nobody left to notify.
        let _ = self.outbound.send(NetworkEvent::PeerDisconnected {
            peer_id: self.local_id.clone(),
        });
        // Wake our own receive loop so it observes the closed flag.
        let _ = self.self_tx.send(NetworkEvent::PeerDisconnected {
            peer_id: self.remote_id.clone(),
        });
        Ok(())
    }
}
