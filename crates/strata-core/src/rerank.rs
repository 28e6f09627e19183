//! Optional semantic rerank of the head of a result list.
//!
//! The reranker never fails a search: a slow or broken scorer just leaves
//! the diversified order in place and the reason is reported alongside the
//! results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::capability::SemanticScorer;

/// Below this much remaining budget a rerank is not attempted.
pub const MIN_RERANK_BUDGET: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerankSkip {
    /// The search had already used up its latency budget.
    Deadline,
    Timeout,
    Failed(String),
}

impl fmt::Display for RerankSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RerankSkip::Deadline => f.write_str("rerank skipped: latency budget spent"),
            RerankSkip::Timeout => f.write_str("rerank skipped: scorer timed out"),
            RerankSkip::Failed(e) => write!(f, "rerank skipped: {e}"),
        }
    }
}

#[derive(Clone)]
pub struct Reranker {
    scorer: Arc<dyn SemanticScorer>,
    timeout: Duration,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn SemanticScorer>, timeout: Duration) -> Self {
        Self { scorer, timeout }
    }

    /// Score `texts` against `query`, one score per text. The call is
    /// bounded by `min(timeout, remaining)`.
    pub async fn score(
        &self,
        query: &str,
        texts: &[String],
        remaining: Duration,
    ) -> Result<Vec<f32>, RerankSkip> {
        if remaining < MIN_RERANK_BUDGET {
            return Err(RerankSkip::Deadline);
        }
        let limit = self.timeout.min(remaining);
        match tokio::time::timeout(limit, self.scorer.score(query, texts)).await {
            Err(_) => Err(RerankSkip::Timeout),
            Ok(Err(e)) => {
                debug!(error = %e, "semantic scorer failed");
                Err(RerankSkip::Failed(format!("{e:#}")))
            }
            Ok(Ok(scores)) if scores.len() != texts.len() => Err(RerankSkip::Failed(format!(
                "scorer returned {} scores for {} texts",
                scores.len(),
                texts.len()
            ))),
            Ok(Ok(scores)) => Ok(scores),
        }
    }
}

/// Indices of `scores` ordered best-first; equal scores keep their input
/// order.
pub fn rerank_order(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));
    order
}
