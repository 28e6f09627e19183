//! Fan-out of one document's chunks to the three index stores.
//!
//! Writes for the same document id are serialized; unrelated documents
//! proceed in parallel. Within one document the lexical, vector and graph
//! writes run concurrently and each ends in its own [`StoreStatus`]: a
//! failing store never blocks the other two, it is recorded as
//! `Failed { message, attempts }`, where the message is the
//! [`EngineError::WriterFailure`] naming the store, and retried on the next sync from the
//! chunks the catalog already holds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::capability::EntityExtractor;
use crate::embedding::{check_dims, Embedder};
use crate::error::EngineError;
use crate::health::SignalHealth;
use crate::models::{
    Chunk, ChunkEntities, ChunkId, DocumentId, DocumentScope, StoreKind, StoreStatus,
    StoreStatuses,
};
use crate::store::{ChunkVector, Indexes};

const DEFAULT_EMBED_BATCH: usize = 64;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

/// What to write for one document.
#[derive(Debug, Clone, Copy)]
pub struct WritePlan<'a> {
    pub scope: &'a DocumentScope,
    /// The document's complete current chunk set.
    pub chunks: &'a [Chunk],
    /// Chunk ids absent from the previously indexed version. Stores that
    /// indexed that version only receive these; stores that did not
    /// receive every chunk.
    pub new_chunk_ids: &'a HashSet<ChunkId>,
    /// Statuses recorded for the previous version.
    pub previous: &'a StoreStatuses,
    /// Stores to write; the others keep their previous status.
    pub targets: &'a [StoreKind],
}

pub struct IndexWriters {
    indexes: Indexes,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    health: Arc<SignalHealth>,
    min_confidence: f32,
    embed_batch: usize,
    locks: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl IndexWriters {
    pub fn new(indexes: Indexes) -> Self {
        Self {
            indexes,
            embedder: None,
            extractor: None,
            health: Arc::new(SignalHealth::default()),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            embed_batch: DEFAULT_EMBED_BATCH,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_health(mut self, health: Arc<SignalHealth>) -> Self {
        self.health = health;
        self
    }

    /// Entities below this confidence are not written to the graph.
    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_embed_batch(mut self, batch: usize) -> Self {
        self.embed_batch = batch.max(1);
        self
    }

    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn health(&self) -> &Arc<SignalHealth> {
        &self.health
    }

    async fn lock_document(&self, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(document_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Write the planned stores and return the document's new statuses.
    pub async fn write(&self, plan: WritePlan<'_>) -> StoreStatuses {
        let _guard = self.lock_document(&plan.scope.document_id).await;

        let keep: HashSet<ChunkId> = plan.chunks.iter().map(|c| c.id.clone()).collect();
        let (plan, keep) = (&plan, &keep);
        let results = join_all(
            plan.targets.iter().map(|kind| async move {
                let result = self.write_store(*kind, plan, keep).await.map_err(|e| {
                    EngineError::WriterFailure {
                        store: *kind,
                        message: format!("{e:#}"),
                    }
                });
                (*kind, result)
            }),
        )
        .await;

        let mut statuses = plan.previous.clone();
        for (kind, result) in results {
            let status = match result {
                Ok(()) => StoreStatus::Indexed,
                Err(failure) => {
                    warn!(
                        document = %plan.scope.path,
                        store = %kind,
                        error = %failure,
                        "store write failed"
                    );
                    StoreStatus::Failed {
                        message: failure.to_string(),
                        attempts: plan.previous.get(kind).attempts() + 1,
                    }
                }
            };
            statuses.set(kind, status);
        }
        statuses
    }

    async fn write_store(
        &self,
        kind: StoreKind,
        plan: &WritePlan<'_>,
        keep: &HashSet<ChunkId>,
    ) -> Result<()> {
        let to_write: Vec<Chunk> = if plan.previous.get(kind).is_indexed() {
            plan.chunks
                .iter()
                .filter(|c| plan.new_chunk_ids.contains(&c.id))
                .cloned()
                .collect()
        } else {
            plan.chunks.to_vec()
        };
        let doc_id = plan.scope.document_id.as_str();
        debug!(document = %plan.scope.path, store = %kind, chunks = to_write.len(), "writing");

        match kind {
            StoreKind::Lexical => {
                if !to_write.is_empty() {
                    self.indexes.lexical.upsert(plan.scope, &to_write).await?;
                }
                self.indexes.lexical.retain_chunks(doc_id, keep).await?;
            }
            StoreKind::Vector => {
                if !to_write.is_empty() {
                    if let Some(embedder) = &self.embedder {
                        let vectors = self.embed_chunks(embedder.as_ref(), &to_write).await?;
                        self.indexes.vector.upsert(plan.scope, &vectors).await?;
                    }
                }
                self.indexes.vector.retain_chunks(doc_id, keep).await?;
            }
            StoreKind::Graph => {
                if !to_write.is_empty() {
                    if let Some(extractor) = &self.extractor {
                        let entities = self.extract_chunks(extractor.as_ref(), &to_write).await?;
                        self.indexes.graph.upsert(plan.scope, &entities).await?;
                    }
                }
                self.indexes.graph.retain_chunks(doc_id, keep).await?;
            }
        }
        Ok(())
    }

    async fn embed_chunks(&self, embedder: &dyn Embedder, chunks: &[Chunk]) -> Result<Vec<ChunkVector>> {
        if !self.health.should_attempt(StoreKind::Vector) {
            anyhow::bail!("embedding unavailable: vector signal degraded");
        }
        let mut out = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.embed_batch) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder
                .embed_batch(&texts)
                .await
                .and_then(|v| check_dims(&v, embedder.dims()).map(|()| v));
            let vectors = match vectors {
                Ok(v) => v,
                Err(e) => {
                    self.health.record_failure(StoreKind::Vector, &e.to_string());
                    return Err(e.into());
                }
            };
            out.extend(batch.iter().zip(vectors).map(|(c, vector)| ChunkVector {
                chunk_id: c.id.clone(),
                vector,
            }));
        }
        self.health.record_success(StoreKind::Vector);
        Ok(out)
    }

    async fn extract_chunks(
        &self,
        extractor: &dyn EntityExtractor,
        chunks: &[Chunk],
    ) -> Result<Vec<ChunkEntities>> {
        if !self.health.should_attempt(StoreKind::Graph) {
            anyhow::bail!("entity extraction unavailable: graph signal degraded");
        }
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match extractor.extract(&chunk.text).await {
                Ok(entities) => out.push(ChunkEntities {
                    chunk_id: chunk.id.clone(),
                    entities: entities
                        .into_iter()
                        .filter(|e| e.confidence >= self.min_confidence)
                        .collect(),
                }),
                Err(e) => {
                    self.health.record_failure(StoreKind::Graph, &e.to_string());
                    return Err(e.into());
                }
            }
        }
        self.health.record_success(StoreKind::Graph);
        Ok(out)
    }

    /// Remove a document from all three stores.
    pub async fn retire(&self, document_id: &str) -> Result<()> {
        let _guard = self.lock_document(document_id).await;
        let (lexical, vector, graph) = tokio::join!(
            self.indexes.lexical.delete_document(document_id),
            self.indexes.vector.delete_document(document_id),
            self.indexes.graph.delete_document(document_id),
        );
        lexical?;
        vector?;
        graph?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, EngineResult};
    use crate::models::{ChunkKind, ExtractedEntity};
    use crate::store::{MatchMode, SearchFilter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyEmbedder {
        down: AtomicBool,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
            if self.down.load(Ordering::SeqCst) {
                Err(EngineError::EmbeddingUnavailable("offline".into()))
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    struct Names;

    #[async_trait]
    impl EntityExtractor for Names {
        fn name(&self) -> &str {
            "names"
        }
        async fn extract(&self, _text: &str) -> EngineResult<Vec<ExtractedEntity>> {
            Ok(vec![
                ExtractedEntity {
                    kind: "name".into(),
                    name: "Strong".into(),
                    relations: vec![],
                    confidence: 0.9,
                },
                ExtractedEntity {
                    kind: "name".into(),
                    name: "Weak".into(),
                    relations: vec![],
                    confidence: 0.1,
                },
            ])
        }
    }

    fn scope() -> DocumentScope {
        DocumentScope {
            document_id: "d".into(),
            source_id: "s".into(),
            path: "a.md".into(),
            content_type: "markdown".into(),
        }
    }

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: "d".into(),
            ordinal: 0,
            start: 0,
            end: text.len(),
            overlap_start: 0,
            text: text.into(),
            kind: ChunkKind::Prose,
            token_estimate: 1,
            hash: String::new(),
            prev_id: None,
            next_id: None,
        }
    }

    #[tokio::test]
    async fn one_failing_store_does_not_block_others() {
        let embedder = Arc::new(FlakyEmbedder {
            down: AtomicBool::new(true),
        });
        let writers = IndexWriters::new(Indexes::in_memory())
            .with_embedder(embedder.clone())
            .with_extractor(Arc::new(Names))
            .with_health(Arc::new(SignalHealth::new(std::time::Duration::ZERO)));

        let chunks = vec![chunk("c1", "hello strata")];
        let new_ids: HashSet<ChunkId> = chunks.iter().map(|c| c.id.clone()).collect();
        let previous = StoreStatuses::pending();
        let statuses = writers
            .write(WritePlan {
                scope: &scope(),
                chunks: &chunks,
                new_chunk_ids: &new_ids,
                previous: &previous,
                targets: &StoreKind::ALL,
            })
            .await;

        assert!(statuses.lexical.is_indexed());
        assert!(statuses.graph.is_indexed());
        assert_eq!(statuses.vector.attempts(), 1);
        match &statuses.vector {
            StoreStatus::Failed { message, .. } => {
                assert!(message.starts_with("vector writer failed: "), "{message}");
                assert!(message.contains("offline"), "{message}");
            }
            other => panic!("expected a failed vector status, got {other:?}"),
        }
        assert!(writers.health().is_degraded(StoreKind::Vector));

        let hits = writers
            .indexes()
            .lexical
            .search("hello", MatchMode::Fuzzy, &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let graph_hits = writers
            .indexes()
            .graph
            .search("weak", &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert!(graph_hits.is_empty(), "low-confidence entity was written");

        // Retry only the failed store once the embedder is back.
        embedder.down.store(false, Ordering::SeqCst);
        let retried = writers
            .write(WritePlan {
                scope: &scope(),
                chunks: &chunks,
                new_chunk_ids: &HashSet::new(),
                previous: &statuses,
                targets: &statuses.unindexed(),
            })
            .await;
        assert!(retried.all_indexed());
        assert!(!writers.health().is_degraded(StoreKind::Vector));
        let vectors = writers
            .indexes()
            .vector
            .get_vectors(&["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn retain_drops_stale_chunks() {
        let writers = IndexWriters::new(Indexes::in_memory());
        let v1 = vec![chunk("old", "old words"), chunk("kept", "kept words")];
        let all: HashSet<ChunkId> = v1.iter().map(|c| c.id.clone()).collect();
        let statuses = writers
            .write(WritePlan {
                scope: &scope(),
                chunks: &v1,
                new_chunk_ids: &all,
                previous: &StoreStatuses::pending(),
                targets: &StoreKind::ALL,
            })
            .await;

        let v2 = vec![chunk("kept", "kept words")];
        writers
            .write(WritePlan {
                scope: &scope(),
                chunks: &v2,
                new_chunk_ids: &HashSet::new(),
                previous: &statuses,
                targets: &StoreKind::ALL,
            })
            .await;
        let hits = writers
            .indexes()
            .lexical
            .search("old", MatchMode::Fuzzy, &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());

        writers.retire("d").await.unwrap();
        let hits = writers
            .indexes()
            .lexical
            .search("kept", MatchMode::Fuzzy, &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
