//! Engine error kinds.
//!
//! Store backends and the application crate speak `anyhow::Result`; the
//! variants here are the points where a caller has to branch on what went
//! wrong (skip a document, degrade a signal, abort a source).

use std::path::PathBuf;

use thiserror::Error;

use crate::models::{SourceId, StoreKind};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Root missing, permission denied, or otherwise unwalkable. The source
    /// enters the error state and the sync for that source aborts.
    #[error("source unreachable: {path}: {reason}")]
    SourceUnreachable { path: PathBuf, reason: String },

    /// The cleaner has no way to turn these bytes into text.
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    /// A single store write failed; other stores are unaffected.
    #[error("{store} writer failed: {message}")]
    WriterFailure { store: StoreKind, message: String },

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("entity extraction unavailable: {0}")]
    ExtractionUnavailable(String),

    #[error("{0} store timed out")]
    QueryStoreTimeout(StoreKind),

    #[error("access to {0} denied by policy")]
    PolicyDenied(PathBuf),

    #[error("source not found: {0}")]
    SourceNotFound(SourceId),

    #[error("source already registered as {id}: {path}")]
    SourceAlreadyRegistered { id: SourceId, path: PathBuf },

    #[error("sync already running for source {0}")]
    SyncInProgress(SourceId),

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The source/document registry failed underneath us.
    #[error("catalog error: {0:#}")]
    Catalog(anyhow::Error),
}

impl EngineError {
    /// True for the two capability outages that degrade a signal instead of
    /// failing an operation.
    pub fn is_capability_outage(&self) -> bool {
        matches!(
            self,
            EngineError::EmbeddingUnavailable(_) | EngineError::ExtractionUnavailable(_)
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
