//! The catalog: sources, documents, chunks and per-store statuses.
//!
//! The catalog is the system of record for *what should be indexed*. The
//! three index stores only hold derived projections keyed by id, so every
//! cascade (retiring a document, unregistering a source) starts from the
//! ids recorded here.

pub mod memory;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChunkId, Document, Source, SourceState, StoreStatuses};

/// A chunk together with the document fields needed to present it.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub source_id: String,
    pub path: String,
    pub content_type: String,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_source(&self, source: &Source) -> Result<()>;

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    async fn find_source_by_root(&self, root: &Path) -> Result<Option<Source>>;

    /// All sources, oldest first.
    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Persist a state transition. `synced_at` updates `last_synced_at`
    /// when given.
    async fn set_source_state(
        &self,
        id: &str,
        state: &SourceState,
        synced_at: Option<i64>,
    ) -> Result<()>;

    /// Delete the source and every document and chunk recorded under it.
    async fn delete_source(&self, id: &str) -> Result<()>;

    async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Record a document and replace its chunk set in one step.
    async fn commit_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()>;

    async fn set_store_statuses(&self, document_id: &str, stores: &StoreStatuses) -> Result<()>;

    async fn delete_document(&self, id: &str) -> Result<()>;

    /// Chunks of one document ordered by ordinal.
    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Look up chunks by id across documents; unknown ids are absent.
    async fn lookup_chunks(&self, ids: &[ChunkId]) -> Result<HashMap<ChunkId, ChunkRecord>>;
}
