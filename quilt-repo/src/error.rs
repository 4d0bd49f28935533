//! Error types for the Quilt engine.

use thiserror::Error;

use crate::storage::StorageError;
use quilt_types::UrlError;

/// Errors surfaced by [`Repo`](crate::Repo) operations and message handling.
#[derive(Debug, Error)]
pub enum RepoError {
    /// A message arrived with a document id that does not belong to the
    /// synchronizer handling it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A document URL failed to parse.
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    /// Cloning was attempted before the source document became ready.
    #[error("source document is not ready to clone")]
    CloneNotReady,

    /// A storage operation failed during an explicit load.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An operation required the network subsystem before any adapter
    /// reported readiness.
    #[error("network subsystem is not ready")]
    NetworkNotReady,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RepoError>();
    }

    #[test]
    fn url_error_converts() {
        let err: RepoError = quilt_types::parse_document_url("garbage").unwrap_err().into();
        assert!(matches!(err, RepoError::InvalidUrl(_)));
    }
}
