//! Error taxonomy for the ingestion subsystem.
//!
//! Two families of errors exist:
//!
//! - [`SourceError`]: returned by orchestrator, registry and credential
//!   operations. Configuration and availability problems are source-local:
//!   the orchestrator logs them and keeps going. Only [`SourceError::UnknownSource`]
//!   is meant to reach the caller as a programming mistake.
//! - [`ReadError`]: yielded by a source's item iterator for a single record.
//!   A [`ReadError::Malformed`] record is skipped; a [`ReadError::Source`]
//!   failure ends the current batch.
//!
//! Running out of items is never an error: the iterator simply ends.

use thiserror::Error;

/// Errors raised by the orchestrator, registry and credential resolver.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Bad or missing type tag, duplicate id, or failed config validation.
    #[error("configuration error for source '{id}': {message}")]
    Configuration { id: String, message: String },

    /// Dependency missing, credentials bad, endpoint unreachable.
    #[error("source '{id}' is unavailable: {message}")]
    Unavailable { id: String, message: String },

    /// A source id that is not registered in the orchestrator.
    #[error("unknown source: '{0}'")]
    UnknownSource(String),

    /// The item store refused an item.
    #[error("item '{item_id}' rejected: {message}")]
    ItemRejected { item_id: String, message: String },

    /// A required credential could not be resolved.
    #[error("missing required credential '{0}'")]
    Credential(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure while pulling a single record from a source iterator.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The record at `position` could not be decoded; it is skipped.
    #[error("malformed record at position {position}: {message}")]
    Malformed { position: usize, message: String },

    /// The underlying source failed; the current batch stops here.
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

impl ReadError {
    pub fn malformed(position: usize, message: impl Into<String>) -> Self {
        ReadError::Malformed {
            position,
            message: message.into(),
        }
    }
}
