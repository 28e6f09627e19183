//! Maximal Marginal Relevance.
//!
//! Greedy selection maximising `λ·relevance − (1−λ)·max_sim(selected)`.
//! Relevance is the fused score normalised by the best fused score.
//! Similarity is cosine when both chunks have a stored vector and token-set
//! Jaccard otherwise; chunks of the same document are never less than
//! [`SAME_DOCUMENT_FLOOR`] similar.

use std::collections::HashSet;

use crate::embedding::cosine_similarity;

pub const DEFAULT_LAMBDA: f64 = 0.7;
pub const SAME_DOCUMENT_FLOOR: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct MmrCandidate {
    pub document_id: String,
    /// Fused score, any positive scale.
    pub relevance: f64,
    pub vector: Option<Vec<f32>>,
    pub tokens: HashSet<String>,
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

pub fn similarity(a: &MmrCandidate, b: &MmrCandidate) -> f64 {
    let sim = match (&a.vector, &b.vector) {
        (Some(va), Some(vb)) if va.len() == vb.len() => cosine_similarity(va, vb) as f64,
        _ => jaccard(&a.tokens, &b.tokens),
    };
    if a.document_id == b.document_id {
        sim.max(SAME_DOCUMENT_FLOOR)
    } else {
        sim
    }
}

/// Select up to `limit` candidates. Returns `(index, mmr_score)` pairs in
/// selection order. Input order breaks ties, so callers should pass
/// candidates best-first.
pub fn mmr_select(candidates: &[MmrCandidate], lambda: f64, limit: usize) -> Vec<(usize, f64)> {
    let lambda = lambda.clamp(0.0, 1.0);
    let max_rel = candidates
        .iter()
        .map(|c| c.relevance)
        .fold(0.0_f64, f64::max);

    let mut selected: Vec<(usize, f64)> = Vec::with_capacity(limit.min(candidates.len()));
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < limit && !remaining.is_empty() {
        let mut best: Option<(usize, f64)> = None;
        for (pos, &idx) in remaining.iter().enumerate() {
            let rel = if max_rel > 0.0 {
                candidates[idx].relevance / max_rel
            } else {
                0.0
            };
            let max_sim = selected
                .iter()
                .map(|(s, _)| similarity(&candidates[idx], &candidates[*s]))
                .fold(0.0_f64, f64::max);
            let score = lambda * rel - (1.0 - lambda) * max_sim;
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((pos, score));
            }
        }
        let Some((pos, score)) = best else {
            break;
        };
        let idx = remaining.remove(pos);
        selected.push((idx, score));
    }
    selected
}
