//! Hybrid retrieval over the lexical, vector and graph stores.
//!
//! # Pipeline
//!
//! 1. Classify the query ([`classify`]) and look up the class's store
//!    weights in the [`StrategyTable`]; the search mode may override them.
//! 2. Zero the weight of signals that cannot contribute (no embedder,
//!    degraded capability, graph extraction disabled).
//! 3. Fetch the top `candidate_k` from every store with a non-zero weight,
//!    concurrently, each bounded by `store_timeout`. A store that times out
//!    or fails contributes an empty list and a degraded note.
//! 4. Fuse the lists with weighted RRF ([`fuse`]).
//! 5. Diversify the fused top `mmr_candidates` with MMR ([`mmr_select`]).
//! 6. Optionally rerank the head with a [`SemanticScorer`] when there is
//!    latency budget left. Lexical-mode searches and searches whose vector
//!    signal was zeroed keep their fused order.
//!
//! A search never returns an error: no matches is an empty result list.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::SemanticScorer;
use crate::catalog::Catalog;
use crate::classify::{
    classify, quoted_phrases, QueryClass, SearchMode, StrategyTable, StrategyWeights,
};
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::fusion::{fuse, FusedCandidate, SignalScore, DEFAULT_RANK_CONSTANT};
use crate::health::SignalHealth;
use crate::mmr::{mmr_select, MmrCandidate, DEFAULT_LAMBDA};
use crate::models::{ChunkId, ChunkKind, StoreKind};
use crate::rerank::{rerank_order, Reranker};
use crate::store::{make_snippet, tokenize, ChunkCandidate, Indexes, MatchMode, SearchFilter};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Candidates fetched from each store.
    pub candidate_k: usize,
    /// `k` in `weight / (k + rank)`.
    pub rank_constant: f64,
    /// Results returned when the request sets no limit.
    pub final_limit: usize,
    pub mmr_lambda: f64,
    /// How many fused candidates enter MMR.
    pub mmr_candidates: usize,
    pub store_timeout: Duration,
    pub rerank: bool,
    pub rerank_top: usize,
    pub rerank_timeout: Duration,
    /// Overall time after which optional work (rerank) is skipped.
    pub latency_budget: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_k: 50,
            rank_constant: DEFAULT_RANK_CONSTANT,
            final_limit: 10,
            mmr_lambda: DEFAULT_LAMBDA,
            mmr_candidates: 30,
            store_timeout: Duration::from_millis(1500),
            rerank: true,
            rerank_top: 10,
            rerank_timeout: Duration::from_millis(800),
            latency_budget: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub filter: SearchFilter,
    pub mode: SearchMode,
    /// Overrides [`SearchConfig::final_limit`].
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Per-result scoring detail.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical: Option<SignalScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<SignalScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<SignalScore>,
    pub fused: f64,
    pub mmr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedResult {
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub source_id: String,
    /// Path relative to the source root.
    pub path: String,
    pub ordinal: usize,
    pub kind: ChunkKind,
    /// Fused RRF score; results are ordered by position, not by this value,
    /// once MMR or rerank have run.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub class: QueryClass,
    pub mode: SearchMode,
    /// Weights actually applied, after degraded signals were zeroed.
    pub weights: StrategyWeights,
    pub results: Vec<RankedResult>,
    /// Human-readable notes for every signal that did not contribute fully.
    pub degraded: Vec<String>,
    pub elapsed_ms: u64,
}

enum Fetch {
    Done(Vec<ChunkCandidate>),
    Skipped,
    Failed(String),
}

/// Run `fut` unless cancelled, bounded by `limit`.
async fn bounded<F>(kind: StoreKind, limit: Duration, cancel: &CancellationToken, fut: F) -> Fetch
where
    F: std::future::Future<Output = anyhow::Result<Vec<ChunkCandidate>>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Fetch::Failed(format!("{kind} retrieval cancelled")),
        res = tokio::time::timeout(limit, fut) => match res {
            Err(_) => {
                warn!(store = %kind, "store query timed out");
                Fetch::Failed(EngineError::QueryStoreTimeout(kind).to_string())
            }
            Ok(Err(e)) => {
                warn!(store = %kind, error = %format!("{e:#}"), "store query failed");
                Fetch::Failed(format!("{kind} store failed: {e:#}"))
            }
            Ok(Ok(list)) => Fetch::Done(list),
        },
    }
}

pub struct HybridSearcher {
    indexes: Indexes,
    catalog: Arc<dyn Catalog>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Reranker>,
    health: Arc<SignalHealth>,
    strategy: StrategyTable,
    graph_enabled: bool,
    config: SearchConfig,
}

impl HybridSearcher {
    pub fn new(indexes: Indexes, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            indexes,
            catalog,
            embedder: None,
            reranker: None,
            health: Arc::new(SignalHealth::default()),
            strategy: StrategyTable::default(),
            graph_enabled: true,
            config: SearchConfig::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Enables the rerank pass. Call after [`Self::with_config`] so the
    /// configured rerank timeout applies.
    pub fn with_scorer(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.reranker = Some(Reranker::new(scorer, self.config.rerank_timeout));
        self
    }

    pub fn with_health(mut self, health: Arc<SignalHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyTable) -> Self {
        self.strategy = strategy;
        self
    }

    /// Whether chunks are run through an entity extractor at all. Without
    /// one the graph store stays empty and gets no weight.
    pub fn with_graph_enabled(mut self, enabled: bool) -> Self {
        self.graph_enabled = enabled;
        self
    }

    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Weights for this query after zeroing signals that cannot answer.
    fn effective_weights(
        &self,
        class: QueryClass,
        mode: SearchMode,
        notes: &mut Vec<String>,
    ) -> StrategyWeights {
        let mut weights = self.strategy.resolve(class, mode);

        if weights.vector > 0.0 {
            if self.embedder.is_none() {
                weights = weights.without(StoreKind::Vector);
                notes.push("vector: no embedding provider configured".to_string());
            } else if !self.health.should_attempt(StoreKind::Vector) {
                weights = weights.without(StoreKind::Vector);
                notes.push(format!("vector: {}", self.degraded_reason(StoreKind::Vector)));
            }
        }
        if weights.graph > 0.0 {
            if !self.graph_enabled {
                weights = weights.without(StoreKind::Graph);
            } else if self.health.is_degraded(StoreKind::Graph) {
                weights = weights.without(StoreKind::Graph);
                notes.push(format!("graph: {}", self.degraded_reason(StoreKind::Graph)));
            }
        }
        weights
    }

    fn degraded_reason(&self, kind: StoreKind) -> String {
        self.health
            .degraded()
            .into_iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, reason)| format!("degraded ({reason})"))
            .unwrap_or_else(|| "degraded".to_string())
    }

    async fn fetch_lexical(
        &self,
        req: &SearchRequest,
        class: QueryClass,
    ) -> anyhow::Result<Vec<ChunkCandidate>> {
        let k = self.config.candidate_k;
        let lexical = &self.indexes.lexical;
        if class == QueryClass::Exact {
            let phrases = quoted_phrases(&req.query);
            if let Some(phrase) = phrases.iter().max_by_key(|p| p.len()) {
                let hits = lexical.search(phrase, MatchMode::Exact, &req.filter, k).await?;
                if !hits.is_empty() {
                    return Ok(hits);
                }
                debug!(phrase = %phrase, "no exact phrase match, falling back to fuzzy");
            }
        }
        lexical.search(&req.query, MatchMode::Fuzzy, &req.filter, k).await
    }

    async fn fetch_vector(&self, req: &SearchRequest) -> anyhow::Result<Vec<ChunkCandidate>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        let query_vec = match embedder.embed(&req.query).await {
            Ok(v) => {
                self.health.record_success(StoreKind::Vector);
                v
            }
            Err(e) => {
                if e.is_capability_outage() {
                    self.health.record_failure(StoreKind::Vector, &e.to_string());
                }
                return Err(e.into());
            }
        };
        self.indexes
            .vector
            .search(&query_vec, &req.filter, self.config.candidate_k)
            .await
    }

    async fn fetch_graph(&self, req: &SearchRequest) -> anyhow::Result<Vec<ChunkCandidate>> {
        self.indexes
            .graph
            .search(&req.query, &req.filter, self.config.candidate_k)
            .await
    }

    /// Run a search. Cancellation returns whatever retrieval had completed.
    pub async fn search(&self, req: &SearchRequest, cancel: &CancellationToken) -> SearchResponse {
        let started = Instant::now();
        let class = classify(&req.query);
        let mut notes = Vec::new();
        let limit = req.limit.unwrap_or(self.config.final_limit);

        let mut response = SearchResponse {
            query: req.query.clone(),
            class,
            mode: req.mode,
            weights: StrategyWeights::new(0.0, 0.0, 0.0),
            results: Vec::new(),
            degraded: Vec::new(),
            elapsed_ms: 0,
        };
        if req.query.trim().is_empty() || limit == 0 {
            return response;
        }

        let mut weights = self.effective_weights(class, req.mode, &mut notes);
        response.weights = weights;

        let timeout = self.config.store_timeout;
        let skip = |kind: StoreKind| weights.get(kind) <= 0.0;
        let (lexical, vector, graph) = tokio::join!(
            async {
                if skip(StoreKind::Lexical) {
                    return Fetch::Skipped;
                }
                bounded(StoreKind::Lexical, timeout, cancel, self.fetch_lexical(req, class)).await
            },
            async {
                if skip(StoreKind::Vector) {
                    return Fetch::Skipped;
                }
                bounded(StoreKind::Vector, timeout, cancel, self.fetch_vector(req)).await
            },
            async {
                if skip(StoreKind::Graph) {
                    return Fetch::Skipped;
                }
                bounded(StoreKind::Graph, timeout, cancel, self.fetch_graph(req)).await
            },
        );

        let mut lists = Vec::with_capacity(3);
        for (kind, fetch) in [
            (StoreKind::Lexical, lexical),
            (StoreKind::Vector, vector),
            (StoreKind::Graph, graph),
        ] {
            match fetch {
                Fetch::Done(list) => {
                    debug!(store = %kind, candidates = list.len(), "store answered");
                    lists.push((kind, list));
                }
                Fetch::Skipped => {}
                Fetch::Failed(note) => {
                    weights = weights.without(kind);
                    notes.push(note);
                }
            }
        }
        response.weights = weights;

        let mut fused = fuse(&lists, &weights, self.config.rank_constant);
        fused.truncate(self.config.mmr_candidates.max(limit));

        // The rerank is a semantic signal: it must not reorder a lexical-only
        // search, nor stand in for a vector store that could not answer.
        let semantic = req.mode != SearchMode::Lexical && weights.vector > 0.0;
        response.results = self
            .diversify(req, fused, limit, semantic, started, &mut notes)
            .await;
        response.degraded = notes;
        response.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            query = %req.query,
            class = %class,
            results = response.results.len(),
            elapsed_ms = response.elapsed_ms,
            "search finished"
        );
        response
    }

    /// MMR over the fused head, then the optional rerank when `semantic`
    /// retrieval took part in this search.
    async fn diversify(
        &self,
        req: &SearchRequest,
        fused: Vec<FusedCandidate>,
        limit: usize,
        semantic: bool,
        started: Instant,
        notes: &mut Vec<String>,
    ) -> Vec<RankedResult> {
        if fused.is_empty() {
            return Vec::new();
        }
        let ids: Vec<ChunkId> = fused.iter().map(|f| f.chunk_id.clone()).collect();
        let records = match self.catalog.lookup_chunks(&ids).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "chunk lookup failed");
                notes.push(format!("catalog lookup failed: {e:#}"));
                return Vec::new();
            }
        };
        // Stores may briefly hold chunks the catalog has already retired.
        let fused: Vec<FusedCandidate> = fused
            .into_iter()
            .filter(|f| records.contains_key(&f.chunk_id))
            .collect();

        let vectors = if self.embedder.is_some() {
            let present: Vec<ChunkId> = fused.iter().map(|f| f.chunk_id.clone()).collect();
            self.indexes
                .vector
                .get_vectors(&present)
                .await
                .unwrap_or_default()
        } else {
            Default::default()
        };

        let candidates: Vec<MmrCandidate> = fused
            .iter()
            .map(|f| {
                let text = records
                    .get(&f.chunk_id)
                    .map(|r| r.chunk.text.as_str())
                    .unwrap_or_default();
                MmrCandidate {
                    document_id: f.document_id.clone(),
                    relevance: f.score,
                    vector: vectors.get(&f.chunk_id).cloned(),
                    tokens: tokenize(text).into_iter().collect::<HashSet<_>>(),
                }
            })
            .collect();

        let mut results: Vec<RankedResult> = mmr_select(&candidates, self.config.mmr_lambda, limit)
            .into_iter()
            .filter_map(|(idx, mmr)| {
                let f = &fused[idx];
                let record = records.get(&f.chunk_id)?;
                let snippet = if f.snippet.is_empty() {
                    make_snippet(&record.chunk.text, &tokenize(&req.query), 240)
                } else {
                    f.snippet.clone()
                };
                Some(RankedResult {
                    chunk_id: f.chunk_id.clone(),
                    document_id: f.document_id.clone(),
                    source_id: record.source_id.clone(),
                    path: record.path.clone(),
                    ordinal: record.chunk.ordinal,
                    kind: record.chunk.kind,
                    score: f.score,
                    breakdown: ScoreBreakdown {
                        lexical: f.lexical,
                        vector: f.vector,
                        graph: f.graph,
                        fused: f.score,
                        mmr,
                        rerank: None,
                    },
                    snippet,
                })
            })
            .collect();

        if self.config.rerank && results.len() > 1 && !semantic && self.reranker.is_some() {
            debug!(mode = ?req.mode, "rerank skipped: no semantic signal in this search");
        }
        if self.config.rerank && semantic && results.len() > 1 {
            if let Some(reranker) = &self.reranker {
                let top = self.config.rerank_top.min(results.len());
                let texts: Vec<String> = results[..top]
                    .iter()
                    .map(|r| {
                        records
                            .get(&r.chunk_id)
                            .map(|rec| rec.chunk.text.clone())
                            .unwrap_or_default()
                    })
                    .collect();
                let remaining = self.config.latency_budget.saturating_sub(started.elapsed());
                match reranker.score(&req.query, &texts, remaining).await {
                    Ok(scores) => {
                        let head: Vec<RankedResult> = results.drain(..top).collect();
                        let mut reordered: Vec<RankedResult> = rerank_order(&scores)
                            .into_iter()
                            .map(|i| {
                                let mut r = head[i].clone();
                                r.breakdown.rerank = Some(scores[i]);
                                r
                            })
                            .collect();
                        reordered.append(&mut results);
                        results = reordered;
                    }
                    Err(skip) => {
                        debug!(reason = %skip, "rerank skipped");
                        notes.push(skip.to_string());
                    }
                }
            }
        }
        results
    }
}
