//! External capabilities consumed by the engine.
//!
//! The engine never decides policy, runs models or scores relevance itself;
//! it calls out through these traits. All of them may be slow or
//! unavailable, and callers degrade instead of failing when they are.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::EngineResult;
use crate::models::ExtractedEntity;

/// Yes/no answer from the policy engine plus the read paths it grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    pub readonly_paths: Vec<PathBuf>,
}

impl AuthorizationDecision {
    pub fn deny() -> Self {
        Self {
            allowed: false,
            readonly_paths: Vec::new(),
        }
    }
}

pub trait Authorizer: Send + Sync {
    /// Decide whether `path` (already canonical) may be registered.
    fn authorize(&self, path: &Path) -> AuthorizationDecision;
}

/// Grants every path, scoped to the path itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, path: &Path) -> AuthorizationDecision {
        AuthorizationDecision {
            allowed: true,
            readonly_paths: vec![path.to_path_buf()],
        }
    }
}

/// Entity/relationship extraction backend feeding the graph store.
///
/// Failures are reported as
/// [`EngineError::ExtractionUnavailable`](crate::error::EngineError::ExtractionUnavailable).
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, text: &str) -> EngineResult<Vec<ExtractedEntity>>;
}

/// Scores `(query, text)` pairs for the optional rerank pass. Higher is
/// more relevant; one score per input text, in order.
#[async_trait]
pub trait SemanticScorer: Send + Sync {
    async fn score(&self, query: &str, texts: &[String]) -> anyhow::Result<Vec<f32>>;
}

/// [`SemanticScorer`] that compares the query embedding with embeddings of
/// the candidate texts.
pub struct EmbeddingScorer {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl SemanticScorer for EmbeddingScorer {
    async fn score(&self, query: &str, texts: &[String]) -> anyhow::Result<Vec<f32>> {
        let query_vec = self.embedder.embed(query).await?;
        let vectors = self.embedder.embed_batch(texts).await?;
        Ok(vectors
            .iter()
            .map(|v| cosine_similarity(&query_vec, v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
            match text {
                "" => Err(EngineError::EmbeddingUnavailable("empty".into())),
                t if t.contains("cat") => Ok(vec![1.0, 0.0]),
                _ => Ok(vec![0.0, 1.0]),
            }
        }
    }

    #[tokio::test]
    async fn embedding_scorer_orders_by_cosine() {
        let scorer = EmbeddingScorer::new(Arc::new(AxisEmbedder));
        let scores = scorer
            .score("cat food", &["a cat".to_string(), "a dog".to_string()])
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn embedding_scorer_propagates_outage() {
        let scorer = EmbeddingScorer::new(Arc::new(AxisEmbedder));
        assert!(scorer.score("", &["x".to_string()]).await.is_err());
    }

    #[test]
    fn allow_all_scopes_to_path() {
        let d = AllowAll.authorize(Path::new("/data/notes"));
        assert!(d.allowed);
        assert_eq!(d.readonly_paths, vec![PathBuf::from("/data/notes")]);
    }
}
