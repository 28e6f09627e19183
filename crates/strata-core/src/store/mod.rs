//! Index store abstraction.
//!
//! Three store families index the same chunks in structurally different
//! ways:
//!
//! | Trait | Indexes | Search input |
//! |-------|---------|--------------|
//! | [`LexicalIndex`] | chunk text, BM25-style ranking | query text, [`MatchMode`] |
//! | [`VectorIndex`] | one embedding per chunk | query embedding |
//! | [`GraphIndex`] | entities and relations with chunk provenance | query text |
//!
//! Every write is keyed by `(document id, chunk id)` and idempotent, so a
//! document can be rewritten any number of times. Stores never look up the
//! catalog: filters are applied from the [`DocumentScope`] stored with each
//! entry.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChunkEntities, ChunkId, DocumentScope, SourceId};

/// A candidate chunk returned from one store's search.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: ChunkId,
    pub document_id: String,
    /// Raw score from the backend (BM25, cosine similarity, graph weight).
    /// Higher is better for every store.
    pub raw_score: f64,
    /// Text excerpt for display; may be empty when the store keeps no text.
    pub snippet: String,
}

/// An embedding for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkVector {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
}

/// How lexical queries match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The query (quotes removed) must appear as a phrase.
    Exact,
    /// Any query term, each expanded as a prefix.
    Fuzzy,
}

/// Restricts search to some sources and/or content types.
///
/// A content-type entry matches a document when it equals the document's
/// type label (`markdown`, `pdf`), names its language (`rust` for
/// `code:rust`), is a prefix family (`code`), or equals the file extension
/// of its path (`md`, `.rs`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub sources: Vec<SourceId>,
    pub content_types: Vec<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.content_types.is_empty()
    }

    pub fn matches(&self, scope: &DocumentScope) -> bool {
        if !self.sources.is_empty() && !self.sources.contains(&scope.source_id) {
            return false;
        }
        self.content_types.is_empty()
            || self
                .content_types
                .iter()
                .any(|t| content_type_matches(t, scope))
    }
}

fn content_type_matches(filter: &str, scope: &DocumentScope) -> bool {
    let wanted = filter.trim().trim_start_matches('.').to_ascii_lowercase();
    if wanted.is_empty() {
        return false;
    }
    let label = scope.content_type.as_str();
    if label == wanted || label.strip_prefix("code:") == Some(wanted.as_str()) {
        return true;
    }
    if label
        .split_once(':')
        .is_some_and(|(family, _)| family == wanted)
    {
        return true;
    }
    std::path::Path::new(&scope.path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(&wanted))
}

#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Index `chunks` of the document described by `scope`. Re-upserting a
    /// chunk id replaces the previous entry.
    async fn upsert(&self, scope: &DocumentScope, chunks: &[Chunk]) -> Result<()>;

    /// Delete every entry of `document_id` whose chunk id is not in `keep`.
    /// Returns the number of entries removed.
    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Best matches first, at most `limit`.
    async fn search(
        &self,
        query: &str,
        mode: MatchMode,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, scope: &DocumentScope, vectors: &[ChunkVector]) -> Result<()>;

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Cosine-similarity search, best matches first. Vectors with a
    /// similarity of zero or less share nothing with the query and are not
    /// candidates.
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Stored vectors for the given chunks; chunks without one are absent.
    async fn get_vectors(&self, chunk_ids: &[ChunkId]) -> Result<HashMap<ChunkId, Vec<f32>>>;
}

#[async_trait]
pub trait GraphIndex: Send + Sync {
    /// Record entities (nodes) and relations (edges) attributed to chunks of
    /// the document. Replaces whatever the same chunk ids contributed before.
    async fn upsert(&self, scope: &DocumentScope, entities: &[ChunkEntities]) -> Result<()>;

    async fn retain_chunks(&self, document_id: &str, keep: &HashSet<ChunkId>) -> Result<usize>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Chunks mentioning entities named in `query`, plus chunks mentioning
    /// their direct neighbours at a discount.
    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;
}

/// The three stores, shared by the writers and the searcher.
#[derive(Clone)]
pub struct Indexes {
    pub lexical: Arc<dyn LexicalIndex>,
    pub vector: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn GraphIndex>,
}

impl Indexes {
    /// Fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            lexical: Arc::new(memory::InMemoryLexicalIndex::new()),
            vector: Arc::new(memory::InMemoryVectorIndex::new()),
            graph: Arc::new(memory::InMemoryGraphIndex::new()),
        }
    }
}

/// Score multiplier for chunks reached through one relation hop.
pub const NEIGHBOUR_DISCOUNT: f64 = 0.5;

/// Lowercased alphanumeric tokens (underscores kept, so `snake_case`
/// identifiers survive as one token).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "does", "for", "from", "how", "in", "is",
    "it", "of", "on", "or", "the", "to", "was", "what", "when", "where", "which", "who", "why",
    "with",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// How strongly an entity key is named by the query.
///
/// The whole key appearing as a token sequence scores 1.0. Otherwise the
/// share of the key's tokens present among the query's content tokens,
/// scaled by 0.6, so partial hits rank below full names. Zero when nothing
/// matches.
pub fn entity_match_score(query_tokens: &[String], entity_key: &str) -> f64 {
    let key_tokens = tokenize(entity_key);
    if key_tokens.is_empty() {
        return 0.0;
    }
    if query_tokens
        .windows(key_tokens.len())
        .any(|w| w == key_tokens.as_slice())
    {
        return 1.0;
    }
    let content: HashSet<&str> = query_tokens
        .iter()
        .map(String::as_str)
        .filter(|t| t.len() >= 3 && !is_stopword(t))
        .collect();
    let hits = key_tokens
        .iter()
        .filter(|t| content.contains(t.as_str()))
        .count();
    0.6 * hits as f64 / key_tokens.len() as f64
}

/// One entity mention, as read back from a graph store.
#[derive(Debug, Clone)]
pub struct Mention {
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub entity_key: String,
    pub confidence: f64,
}

/// Rank chunks by the entities they mention.
///
/// Entities named by the query score [`entity_match_score`]; entities one
/// edge away from a named entity score [`NEIGHBOUR_DISCOUNT`] times their
/// neighbour's score. A chunk's score is the confidence-weighted sum over
/// the entities it mentions. Both graph backends share this ranking and
/// differ only in how mentions and edges are loaded.
pub fn rank_mentions(
    query: &str,
    mentions: &[Mention],
    edges: &[(String, String)],
    limit: usize,
) -> Vec<ChunkCandidate> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    let mut direct: HashMap<&str, f64> = HashMap::new();
    for m in mentions {
        if direct.contains_key(m.entity_key.as_str()) {
            continue;
        }
        let score = entity_match_score(&query_tokens, &m.entity_key);
        if score > 0.0 {
            direct.insert(m.entity_key.as_str(), score);
        }
    }
    if direct.is_empty() {
        return Vec::new();
    }

    let mut weights: HashMap<&str, f64> = direct.clone();
    for (from, to) in edges {
        for (named, other) in [(from, to), (to, from)] {
            if let Some(score) = direct.get(named.as_str()) {
                let w = weights.entry(other.as_str()).or_insert(0.0);
                *w = w.max(score * NEIGHBOUR_DISCOUNT);
            }
        }
    }

    let mut by_chunk: HashMap<&str, (&str, f64, Vec<&str>)> = HashMap::new();
    for m in mentions {
        let Some(weight) = weights.get(m.entity_key.as_str()) else {
            continue;
        };
        let entry = by_chunk
            .entry(m.chunk_id.as_str())
            .or_insert((m.document_id.as_str(), 0.0, Vec::new()));
        entry.1 += weight * m.confidence;
        if !entry.2.contains(&m.entity_key.as_str()) {
            entry.2.push(m.entity_key.as_str());
        }
    }

    let mut out: Vec<ChunkCandidate> = by_chunk
        .into_iter()
        .map(|(chunk_id, (document_id, score, keys))| ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            raw_score: score,
            snippet: format!("entities: {}", keys.join(", ")),
        })
        .collect();
    sort_candidates(&mut out);
    out.truncate(limit);
    out
}

/// Descending by score, ties by chunk id.
pub fn sort_candidates(candidates: &mut [ChunkCandidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Excerpt of at most `max_chars` characters around the first occurrence
/// of any of `terms` (lowercase), or the head of the text.
pub fn make_snippet(text: &str, terms: &[String], max_chars: usize) -> String {
    let lower = text.to_lowercase();
    let hit = if lower.len() == text.len() {
        terms.iter().filter_map(|t| lower.find(t.as_str())).min()
    } else {
        None
    };
    let start_byte = hit.unwrap_or(0);
    let start_char = text
        .char_indices()
        .take_while(|(i, _)| *i < start_byte)
        .count()
        .saturating_sub(max_chars / 4);
    let snippet: String = text
        .chars()
        .skip(start_char)
        .take(max_chars)
        .collect();
    snippet.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(path: &str, content_type: &str) -> DocumentScope {
        DocumentScope {
            document_id: "d".into(),
            source_id: "s1".into(),
            path: path.into(),
            content_type: content_type.into(),
        }
    }

    #[test]
    fn filter_by_type_and_extension() {
        let rust = scope("src/lib.rs", "code:rust");
        let md = scope("notes/a.md", "markdown");
        let f = |types: &[&str]| SearchFilter {
            sources: vec![],
            content_types: types.iter().map(|s| s.to_string()).collect(),
        };
        assert!(f(&["rust"]).matches(&rust));
        assert!(f(&[".rs"]).matches(&rust));
        assert!(f(&["code"]).matches(&rust));
        assert!(!f(&["code"]).matches(&md));
        assert!(f(&["md"]).matches(&md));
        assert!(f(&["markdown"]).matches(&md));
        assert!(SearchFilter::default().matches(&md));
    }

    #[test]
    fn filter_by_source() {
        let f = SearchFilter {
            sources: vec!["s2".into()],
            content_types: vec![],
        };
        assert!(!f.matches(&scope("a.md", "markdown")));
    }

    #[test]
    fn tokenize_keeps_identifiers() {
        assert_eq!(
            tokenize("parse_config(Path) -> Result"),
            vec!["parse_config", "path", "result"]
        );
    }

    #[test]
    fn entity_scores() {
        let q = tokenize("who wrote the quick brown fox");
        assert_eq!(entity_match_score(&q, "quick brown fox"), 1.0);
        let partial = entity_match_score(&q, "brown bear");
        assert!(partial > 0.0 && partial < 1.0);
        assert_eq!(entity_match_score(&q, "lazy dog"), 0.0);
    }

    fn mention(chunk: &str, key: &str, confidence: f64) -> Mention {
        Mention {
            chunk_id: chunk.into(),
            document_id: format!("doc-{chunk}"),
            entity_key: key.into(),
            confidence,
        }
    }

    #[test]
    fn ranks_direct_above_neighbours() {
        let mentions = vec![
            mention("c1", "quick brown fox", 1.0),
            mention("c2", "lazy dog", 1.0),
            mention("c3", "kennel", 1.0),
        ];
        let edges = vec![("quick brown fox".to_string(), "lazy dog".to_string())];
        let ranked = rank_mentions("quick brown fox", &mentions, &edges, 10);
        let ids: Vec<&str> = ranked.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!((ranked[1].raw_score - NEIGHBOUR_DISCOUNT).abs() < 1e-9);
        assert!(rank_mentions("nothing relevant", &mentions, &edges, 10).is_empty());
    }

    #[test]
    fn snippet_centers_on_term() {
        let text = format!("{} needle here", "filler ".repeat(100));
        let s = make_snippet(&text, &["needle".to_string()], 60);
        assert!(s.contains("needle"));
        assert!(s.chars().count() <= 60);
    }
}
