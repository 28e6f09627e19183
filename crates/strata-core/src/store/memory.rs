//! In-memory index stores for tests and embedding without a database.
//!
//! Lexical search is a small BM25 over tokenized chunk text, vector search
//! is brute-force cosine similarity, and the graph keeps entity mentions per
//! chunk. All three use `tokio::sync::RwLock` for interior mutability.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::embedding::cosine_similarity;
use crate::models::{entity_key, Chunk, ChunkEntities, ChunkId, DocumentScope};

use super::{
    is_stopword, make_snippet, rank_mentions, sort_candidates, tokenize, ChunkCandidate,
    ChunkVector, GraphIndex, LexicalIndex, MatchMode, Mention, SearchFilter, VectorIndex,
};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const SNIPPET_CHARS: usize = 240;

struct LexicalEntry {
    scope: DocumentScope,
    text: String,
    tokens: Vec<String>,
}

/// BM25 lexical index held in memory.
#[derive(Default)]
pub struct InMemoryLexicalIndex {
    entries: RwLock<HashMap<ChunkId, LexicalEntry>>,
}

impl InMemoryLexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let tokens = tokenize(query);
    let content: Vec<String> = tokens.iter().filter(|t| !is_stopword(t)).cloned().collect();
    if content.is_empty() {
        tokens
    } else {
        content
    }
}

fn term_matches(term: &str, token: &str, mode: MatchMode) -> bool {
    match mode {
        MatchMode::Exact => token == term,
        MatchMode::Fuzzy if term.chars().count() >= 3 => token.starts_with(term),
        MatchMode::Fuzzy => token == term,
    }
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && tokens.windows(phrase.len()).any(|w| w == phrase)
}

#[async_trait]
impl LexicalIndex for InMemoryLexicalIndex {
    async fn upsert(&self, scope: &DocumentScope, chunks: &[Chunk]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for chunk in chunks {
            entries.insert(
                chunk.id.clone(),
                LexicalEntry {
                    scope: scope.clone(),
                    text: chunk.text.clone(),
                    tokens: tokenize(&chunk.text),
                },
            );
        }
        Ok(())
    }

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, e| e.scope.document_id != document_id || keep.contains(id));
        Ok(before - entries.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .retain(|_, e| e.scope.document_id != document_id);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        mode: MatchMode,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let phrase = tokenize(query);
        let terms = match mode {
            MatchMode::Exact => phrase.clone(),
            MatchMode::Fuzzy => query_terms(query),
        };
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let total = entries.len().max(1) as f64;
        let avg_len =
            entries.values().map(|e| e.tokens.len()).sum::<usize>() as f64 / total;

        let doc_freq: Vec<usize> = terms
            .iter()
            .map(|term| {
                entries
                    .values()
                    .filter(|e| e.tokens.iter().any(|t| term_matches(term, t, mode)))
                    .count()
            })
            .collect();

        let mut candidates = Vec::new();
        for (chunk_id, entry) in entries.iter() {
            if !filter.matches(&entry.scope) {
                continue;
            }
            if mode == MatchMode::Exact && !contains_phrase(&entry.tokens, &phrase) {
                continue;
            }
            let len_norm = 1.0 - BM25_B + BM25_B * entry.tokens.len() as f64 / avg_len.max(1.0);
            let mut score = 0.0;
            for (term, df) in terms.iter().zip(&doc_freq) {
                let tf = entry
                    .tokens
                    .iter()
                    .filter(|t| term_matches(term, t, mode))
                    .count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let df = *df as f64;
                let idf = (1.0 + (total - df + 0.5) / (df + 0.5)).ln();
                score += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * len_norm);
            }
            if score > 0.0 {
                candidates.push(ChunkCandidate {
                    chunk_id: chunk_id.clone(),
                    document_id: entry.scope.document_id.clone(),
                    raw_score: score,
                    snippet: make_snippet(&entry.text, &terms, SNIPPET_CHARS),
                });
            }
        }
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }
}

struct VectorEntry {
    scope: DocumentScope,
    vector: Vec<f32>,
}

/// Brute-force cosine vector index held in memory.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<ChunkId, VectorEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, scope: &DocumentScope, vectors: &[ChunkVector]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for v in vectors {
            entries.insert(
                v.chunk_id.clone(),
                VectorEntry {
                    scope: scope.clone(),
                    vector: v.vector.clone(),
                },
            );
        }
        Ok(())
    }

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, e| e.scope.document_id != document_id || keep.contains(id));
        Ok(before - entries.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .retain(|_, e| e.scope.document_id != document_id);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let entries = self.entries.read().await;
        let mut candidates: Vec<ChunkCandidate> = entries
            .iter()
            .filter(|(_, e)| filter.matches(&e.scope))
            .map(|(id, e)| ChunkCandidate {
                chunk_id: id.clone(),
                document_id: e.scope.document_id.clone(),
                raw_score: cosine_similarity(query, &e.vector) as f64,
                snippet: String::new(),
            })
            .filter(|c| c.raw_score > 0.0)
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_vectors(&self, chunk_ids: &[ChunkId]) -> Result<HashMap<ChunkId, Vec<f32>>> {
        let entries = self.entries.read().await;
        Ok(chunk_ids
            .iter()
            .filter_map(|id| entries.get(id).map(|e| (id.clone(), e.vector.clone())))
            .collect())
    }
}

struct GraphEntry {
    scope: DocumentScope,
    /// `(entity key, confidence)` per mentioned entity.
    mentions: Vec<(String, f64)>,
    /// Edges between entity keys.
    edges: Vec<(String, String)>,
}

/// Entity graph held in memory, one entry per contributing chunk.
#[derive(Default)]
pub struct InMemoryGraphIndex {
    entries: RwLock<HashMap<ChunkId, GraphEntry>>,
}

impl InMemoryGraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct entity keys currently in the graph.
    pub async fn entity_keys(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .values()
            .flat_map(|e| e.mentions.iter().map(|(k, _)| k.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl GraphIndex for InMemoryGraphIndex {
    async fn upsert(&self, scope: &DocumentScope, entities: &[ChunkEntities]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for ce in entities {
            let mentions = ce
                .entities
                .iter()
                .map(|e| (entity_key(&e.name), e.confidence as f64))
                .collect();
            let edges = ce
                .entities
                .iter()
                .flat_map(|e| {
                    let from = entity_key(&e.name);
                    e.relations
                        .iter()
                        .map(move |r| (from.clone(), entity_key(&r.target)))
                })
                .collect();
            entries.insert(
                ce.chunk_id.clone(),
                GraphEntry {
                    scope: scope.clone(),
                    mentions,
                    edges,
                },
            );
        }
        Ok(())
    }

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, e| e.scope.document_id != document_id || keep.contains(id));
        Ok(before - entries.len())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .retain(|_, e| e.scope.document_id != document_id);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let entries = self.entries.read().await;
        let mut mentions = Vec::new();
        let mut edges = Vec::new();
        for (chunk_id, entry) in entries.iter() {
            edges.extend(entry.edges.iter().cloned());
            if !filter.matches(&entry.scope) {
                continue;
            }
            mentions.extend(entry.mentions.iter().map(|(key, confidence)| Mention {
                chunk_id: chunk_id.clone(),
                document_id: entry.scope.document_id.clone(),
                entity_key: key.clone(),
                confidence: *confidence,
            }));
        }
        Ok(rank_mentions(query, &mentions, &edges, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, ExtractedEntity, ExtractedRelation};

    fn scope(doc: &str, path: &str) -> DocumentScope {
        DocumentScope {
            document_id: doc.into(),
            source_id: "src".into(),
            path: path.into(),
            content_type: "markdown".into(),
        }
    }

    fn chunk(id: &str, doc: &str, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: doc.into(),
            ordinal: 0,
            start: 0,
            end: text.len(),
            overlap_start: 0,
            text: text.into(),
            kind: ChunkKind::Prose,
            token_estimate: text.len() / 4,
            hash: String::new(),
            prev_id: None,
            next_id: None,
        }
    }

    #[tokio::test]
    async fn lexical_fuzzy_and_exact() {
        let idx = InMemoryLexicalIndex::new();
        idx.upsert(&scope("a", "a.md"), &[chunk("c1", "a", "The quick brown fox")])
            .await
            .unwrap();
        idx.upsert(&scope("b", "b.md"), &[chunk("c2", "b", "A lazy dog sleeps; brown quick")])
            .await
            .unwrap();

        let fuzzy = idx
            .search("qui", MatchMode::Fuzzy, &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(fuzzy.len(), 2);

        let exact = idx
            .search("\"quick brown\"", MatchMode::Exact, &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].chunk_id, "c1");
        assert!(exact[0].snippet.contains("quick brown"));
    }

    #[tokio::test]
    async fn lexical_upsert_is_idempotent_and_retain_prunes() {
        let idx = InMemoryLexicalIndex::new();
        let s = scope("a", "a.md");
        let chunks = [chunk("c1", "a", "one"), chunk("c2", "a", "two")];
        idx.upsert(&s, &chunks).await.unwrap();
        idx.upsert(&s, &chunks).await.unwrap();
        assert_eq!(idx.len().await, 2);

        let keep: HashSet<ChunkId> = ["c2".to_string()].into_iter().collect();
        assert_eq!(idx.retain_chunks("a", &keep).await.unwrap(), 1);
        assert_eq!(idx.len().await, 1);

        idx.delete_document("a").await.unwrap();
        assert!(idx.is_empty().await);
    }

    #[tokio::test]
    async fn vector_search_orders_by_cosine() {
        let idx = InMemoryVectorIndex::new();
        idx.upsert(
            &scope("a", "a.md"),
            &[
                ChunkVector {
                    chunk_id: "near".into(),
                    vector: vec![1.0, 0.1],
                },
                ChunkVector {
                    chunk_id: "far".into(),
                    vector: vec![0.0, 1.0],
                },
            ],
        )
        .await
        .unwrap();
        let hits = idx
            .search(&[1.0, 0.0], &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "near");
        let got = idx.get_vectors(&["far".into(), "missing".into()]).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_skips_unrelated_vectors() {
        let idx = InMemoryVectorIndex::new();
        idx.upsert(
            &scope("a", "a.md"),
            &[
                ChunkVector {
                    chunk_id: "orthogonal".into(),
                    vector: vec![0.0, 1.0],
                },
                ChunkVector {
                    chunk_id: "opposite".into(),
                    vector: vec![-1.0, 0.0],
                },
                ChunkVector {
                    chunk_id: "zero".into(),
                    vector: vec![0.0, 0.0],
                },
            ],
        )
        .await
        .unwrap();
        let hits = idx
            .search(&[1.0, 0.0], &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty(), "{:?}", hits);
    }

    #[tokio::test]
    async fn graph_expands_one_hop() {
        let idx = InMemoryGraphIndex::new();
        let fox = ExtractedEntity {
            kind: "name".into(),
            name: "Quick Brown Fox".into(),
            relations: vec![ExtractedRelation {
                kind: "mentions_with".into(),
                target: "Lazy Dog".into(),
            }],
            confidence: 0.9,
        };
        let dog = ExtractedEntity {
            kind: "name".into(),
            name: "Lazy Dog".into(),
            relations: vec![],
            confidence: 0.8,
        };
        idx.upsert(
            &scope("a", "a.md"),
            &[ChunkEntities {
                chunk_id: "c1".into(),
                entities: vec![fox],
            }],
        )
        .await
        .unwrap();
        idx.upsert(
            &scope("b", "b.md"),
            &[ChunkEntities {
                chunk_id: "c2".into(),
                entities: vec![dog],
            }],
        )
        .await
        .unwrap();

        let hits = idx
            .search("quick brown fox", &SearchFilter::default(), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(idx.entity_keys().await, vec!["lazy dog", "quick brown fox"]);

        idx.delete_document("b").await.unwrap();
        let hits = idx
            .search("quick brown fox", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
