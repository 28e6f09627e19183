//! Weighted Reciprocal Rank Fusion.
//!
//! `score(c) = Σ_store weight(store) / (k + rank_store(c))`, with 1-based
//! ranks and `k` the rank constant (default 60). A chunk missing from a
//! store's list gets nothing from that store. Ties are broken by chunk id
//! so the fused order is fully deterministic.

use std::collections::HashMap;

use serde::Serialize;

use crate::classify::StrategyWeights;
use crate::models::StoreKind;
use crate::store::ChunkCandidate;

pub const DEFAULT_RANK_CONSTANT: f64 = 60.0;

/// One store's view of a fused chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalScore {
    /// 1-based rank in the store's list.
    pub rank: usize,
    pub raw_score: f64,
    /// `weight / (k + rank)`.
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
    pub lexical: Option<SignalScore>,
    pub vector: Option<SignalScore>,
    pub graph: Option<SignalScore>,
    pub snippet: String,
}

impl FusedCandidate {
    fn slot(&mut self, kind: StoreKind) -> &mut Option<SignalScore> {
        match kind {
            StoreKind::Lexical => &mut self.lexical,
            StoreKind::Vector => &mut self.vector,
            StoreKind::Graph => &mut self.graph,
        }
    }

    pub fn signal(&self, kind: StoreKind) -> Option<&SignalScore> {
        match kind {
            StoreKind::Lexical => self.lexical.as_ref(),
            StoreKind::Vector => self.vector.as_ref(),
            StoreKind::Graph => self.graph.as_ref(),
        }
    }
}

/// Fuse per-store ranked lists. Lists are assumed best-first; a store with
/// zero weight is ignored entirely.
pub fn fuse(
    lists: &[(StoreKind, Vec<ChunkCandidate>)],
    weights: &StrategyWeights,
    rank_constant: f64,
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<String, FusedCandidate> = HashMap::new();

    for (kind, list) in lists {
        let weight = weights.get(*kind);
        if weight <= 0.0 {
            continue;
        }
        for (i, candidate) in list.iter().enumerate() {
            let entry = fused
                .entry(candidate.chunk_id.clone())
                .or_insert_with(|| FusedCandidate {
                    chunk_id: candidate.chunk_id.clone(),
                    document_id: candidate.document_id.clone(),
                    score: 0.0,
                    lexical: None,
                    vector: None,
                    graph: None,
                    snippet: String::new(),
                });
            let slot = entry.slot(*kind);
            // A store listing the same chunk twice only counts its best rank.
            if slot.is_some() {
                continue;
            }
            let rank = i + 1;
            let contribution = weight / (rank_constant + rank as f64);
            *slot = Some(SignalScore {
                rank,
                raw_score: candidate.raw_score,
                contribution,
            });
            entry.score += contribution;
            if *kind == StoreKind::Lexical || entry.snippet.is_empty() {
                if !candidate.snippet.is_empty() {
                    entry.snippet = candidate.snippet.clone();
                }
            }
        }
    }

    let mut out: Vec<FusedCandidate> = fused.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    out
}
