//! Document URL parsing and formatting.
//!
//! The external form of a document identifier is
//! `automerge:<base58check(bytes)>`. Legacy bare-UUID strings from older
//! deployments are detected and converted with a deprecation warning.

use crate::DocumentId;
use thiserror::Error;

/// URL scheme prefix for document URLs.
pub const URL_PREFIX: &str = "automerge:";

/// Errors produced while parsing a document URL.
#[derive(Debug, Error)]
pub enum UrlError {
    /// The string is neither a prefixed URL nor a legacy UUID.
    #[error("invalid document URL: {0}")]
    MissingPrefix(String),

    /// The payload is not valid Base58Check (bad alphabet or checksum).
    #[error("invalid Base58Check payload: {0}")]
    BadEncoding(String),

    /// The decoded payload is not 16 bytes.
    #[error("document id must be 16 bytes, got {0}")]
    BadLength(usize),
}

/// Format a DocumentId as a document URL.
pub fn format_document_url(id: &DocumentId) -> String {
    format!("{URL_PREFIX}{id}")
}

/// Parse a document URL into a DocumentId.
///
/// Accepts `automerge:<base58check>`. A bare UUID string is accepted as a
/// legacy form and converted, with a deprecation warning.
pub fn parse_document_url(url: &str) -> Result<DocumentId, UrlError> {
    if let Some(payload) = url.strip_prefix(URL_PREFIX) {
        return payload.parse();
    }

    if let Ok(legacy) = uuid::Uuid::parse_str(url) {
        tracing::warn!(
            url,
            "legacy UUID document id; migrate to the automerge: URL form"
        );
        // Uuid is exactly 16 bytes, so this cannot fail
        return DocumentId::from_bytes(legacy.as_bytes())
            .ok_or(UrlError::BadLength(legacy.as_bytes().len()));
    }

    Err(UrlError::MissingPrefix(url.to_string()))
}
