//! Share policy: who gets offered which documents.

use async_trait::async_trait;

use quilt_types::{DocumentId, PeerId};

/// Decides whether a document is offered to a peer.
///
/// Called with `Some(document_id)` when announcing a specific document and
/// with `None` as a peer-level gate. Implementations may consult external
/// state; each call may suspend.
#[async_trait]
pub trait SharePolicy: Send + Sync {
    /// Whether to offer `document_id` (or, with `None`, anything at all)
    /// to `peer_id`.
    async fn should_share(&self, peer_id: &PeerId, document_id: Option<&DocumentId>) -> bool;
}

/// The generous default: every document is offered to every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareAll;

#[async_trait]
impl SharePolicy for ShareAll {
    async fn should_share(&self, _peer_id: &PeerId, _document_id: Option<&DocumentId>) -> bool {
        true
    }
}

/// Never announce documents; peers only receive what they explicitly
/// request. The usual base policy for server-style repos.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareNone;

#[async_trait]
impl SharePolicy for ShareNone {
    async fn should_share(&self, _peer_id: &PeerId, _document_id: Option<&DocumentId>) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn share_all_is_generous() {
        let policy = ShareAll;
        assert!(policy.should_share(&"anyone".into(), None).await);
        assert!(
            policy
                .should_share(&"anyone".into(), Some(&DocumentId::random()))
                .await
        );
    }

    #[tokio::test]
    async fn share_none_refuses() {
        let policy = ShareNone;
        assert!(!policy.should_share(&"anyone".into(), None).await);
        assert!(
            !policy
                .should_share(&"anyone".into(), Some(&DocumentId::random()))
                .await
        );
    }
}
