//! Protocol messages exchanged between repos.
//!
//! Every message is addressed: it names a sender, a target, and the
//! document it concerns. Network adapters handle transport-level framing
//! and handshakes; only these structured messages reach the sync engine.

use serde::{Deserialize, Serialize};

use crate::{DocumentId, MessageError, PeerId};

/// All protocol messages the sync engine sends and receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RepoMessage {
    /// A CRDT sync payload for a document both sides hold (or are building).
    Sync(SyncMessage),
    /// A sync payload from a peer that has no copy of the document yet.
    Request(RequestMessage),
    /// The sender does not have the document and cannot provide it.
    DocUnavailable(DocUnavailableMessage),
    /// An application payload routed alongside a document, outside the CRDT.
    Ephemeral(EphemeralMessage),
}

impl RepoMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        rmp_serde::to_vec(self).map_err(MessageError::Encode)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        rmp_serde::from_slice(bytes).map_err(MessageError::Decode)
    }

    /// The peer that produced this message.
    pub fn sender_id(&self) -> &PeerId {
        match self {
            Self::Sync(m) => &m.sender_id,
            Self::Request(m) => &m.sender_id,
            Self::DocUnavailable(m) => &m.sender_id,
            Self::Ephemeral(m) => &m.sender_id,
        }
    }

    /// The peer this message is addressed to.
    pub fn target_id(&self) -> &PeerId {
        match self {
            Self::Sync(m) => &m.target_id,
            Self::Request(m) => &m.target_id,
            Self::DocUnavailable(m) => &m.target_id,
            Self::Ephemeral(m) => &m.target_id,
        }
    }

    /// The document this message concerns.
    pub fn document_id(&self) -> &DocumentId {
        match self {
            Self::Sync(m) => &m.document_id,
            Self::Request(m) => &m.document_id,
            Self::DocUnavailable(m) => &m.document_id,
            Self::Ephemeral(m) => &m.document_id,
        }
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Request(_) => "request",
            Self::DocUnavailable(_) => "doc-unavailable",
            Self::Ephemeral(_) => "ephemeral",
        }
    }
}

/// A CRDT sync message for a document.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// The peer that generated the payload.
    pub sender_id: PeerId,
    /// The peer the payload was generated for.
    pub target_id: PeerId,
    /// The document being synchronized.
    pub document_id: DocumentId,
    /// Opaque CRDT sync payload.
    pub data: Vec<u8>,
}

impl std::fmt::Debug for SyncMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMessage")
            .field("sender_id", &self.sender_id)
            .field("target_id", &self.target_id)
            .field("document_id", &self.document_id)
            .field("data", &format!("[{} bytes]", self.data.len()))
            .finish()
    }
}

/// A sync message sent while the sender holds no copy of the document.
///
/// Identical payload to [`SyncMessage`]; the distinct type tells the
/// receiver that the sender is asking, not offering.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// The peer asking for the document.
    pub sender_id: PeerId,
    /// The peer being asked.
    pub target_id: PeerId,
    /// The document being requested.
    pub document_id: DocumentId,
    /// Opaque CRDT sync payload (empty heads).
    pub data: Vec<u8>,
}

impl std::fmt::Debug for RequestMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMessage")
            .field("sender_id", &self.sender_id)
            .field("target_id", &self.target_id)
            .field("document_id", &self.document_id)
            .field("data", &format!("[{} bytes]", self.data.len()))
            .finish()
    }
}

/// Notification that the sender cannot provide the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUnavailableMessage {
    /// The peer that does not have the document.
    pub sender_id: PeerId,
    /// The peer that asked for it.
    pub target_id: PeerId,
    /// The document that is unavailable at the sender.
    pub document_id: DocumentId,
}

/// An application payload carried alongside a document.
///
/// Ephemeral messages never touch CRDT state and are not persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMessage {
    /// The peer that produced the payload.
    pub sender_id: PeerId,
    /// The peer the payload is addressed to.
    pub target_id: PeerId,
    /// The document the payload is scoped to.
    pub document_id: DocumentId,
    /// Opaque application bytes.
    pub data: Vec<u8>,
}

impl std::fmt::Debug for EphemeralMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralMessage")
            .field("sender_id", &self.sender_id)
            .field("target_id", &self.target_id)
            .field("document_id", &self.document_id)
            .field("data", &format!("[{} bytes]", self.data.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::random()
    }

    #[test]
    fn sync_roundtrip() {
        let msg = RepoMessage::Sync(SyncMessage {
            sender_id: "alice".into(),
            target_id: "bob".into(),
            document_id: doc(),
            data: vec![1, 2, 3],
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = RepoMessage::from_bytes(&bytes).unwrap();

        assert_eq!(msg, restored);
    }

    #[test]
    fn request_roundtrip() {
        let msg = RepoMessage::Request(RequestMessage {
            sender_id: "alice".into(),
            target_id: "bob".into(),
            document_id: doc(),
            data: vec![],
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = RepoMessage::from_bytes(&bytes).unwrap();

        assert!(matches!(restored, RepoMessage::Request(_)));
        assert_eq!(msg, restored);
    }

    #[test]
    fn doc_unavailable_roundtrip() {
        let msg = RepoMessage::DocUnavailable(DocUnavailableMessage {
            sender_id: "bob".into(),
            target_id: "alice".into(),
            document_id: doc(),
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = RepoMessage::from_bytes(&bytes).unwrap();

        assert_eq!(msg, restored);
    }

    #[test]
    fn ephemeral_roundtrip() {
        let msg = RepoMessage::Ephemeral(EphemeralMessage {
            sender_id: "alice".into(),
            target_id: "bob".into(),
            document_id: doc(),
            data: b"cursor position".to_vec(),
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = RepoMessage::from_bytes(&bytes).unwrap();

        assert_eq!(msg, restored);
    }

    #[test]
    fn accessors_reach_through_variants() {
        let id = doc();
        let msg = RepoMessage::DocUnavailable(DocUnavailableMessage {
            sender_id: "bob".into(),
            target_id: "alice".into(),
            document_id: id,
        });

        assert_eq!(msg.sender_id(), &PeerId::from("bob"));
        assert_eq!(msg.target_id(), &PeerId::from("alice"));
        assert_eq!(msg.document_id(), &id);
        assert_eq!(msg.kind(), "doc-unavailable");
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = RepoMessage::from_bytes(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, MessageError::Decode(_)));
    }

    #[test]
    fn sync_debug_shows_length_not_payload() {
        let msg = SyncMessage {
            sender_id: "alice".into(),
            target_id: "bob".into(),
            document_id: doc(),
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let debug = format!("{:?}", msg);
        assert!(debug.contains("[4 bytes]"), "got: {}", debug);
    }
}
