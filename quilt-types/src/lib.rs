//! # quilt-types
//!
//! Wire format and identifier types for the Quilt sync engine.
//!
//! This crate provides the foundational types used across the Quilt crates:
//! - [`DocumentId`], [`PeerId`] - Identity types
//! - [`parse_document_url`], [`format_document_url`] - The external URL form
//! - [`RepoMessage`] - Protocol messages (Sync, Request, DocUnavailable, Ephemeral)
//! - [`MessageError`], [`UrlError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod url;

pub use error::MessageError;
pub use ids::{DocumentId, PeerId};
pub use messages::{
    DocUnavailableMessage, EphemeralMessage, RepoMessage, RequestMessage, SyncMessage,
};
pub use url::{format_document_url, parse_document_url, UrlError, URL_PREFIX};
