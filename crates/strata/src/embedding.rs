//! Embedding providers.
//!
//! Implements [`strata_core::embedding::Embedder`] for:
//! - **[`OpenAiEmbedder`]**: `POST {url}/embeddings`, OpenAI-compatible APIs.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: in-process fastembed models (feature
//!   `local-embeddings`); no network calls after the model download.
//!
//! Every failure surfaces as
//! [`EngineError::EmbeddingUnavailable`], which the engine treats as a
//! degraded vector signal rather than a hard error.
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use strata_core::embedding::{check_dims, Embedder};
use strata_core::error::{EngineError, EngineResult};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Build the embedder named by `config.provider`; `None` when disabled.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | none, vector signal off |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-embeddings` feature) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Some(Arc::new(local::LocalEmbedder::new(config)?))),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("local embedding provider requires --features local-embeddings"),
        other => bail!("unknown embedding provider: {}", other),
    }
}

fn unavailable(e: impl std::fmt::Display) -> EngineError {
    EngineError::EmbeddingUnavailable(e.to_string())
}

/// Connection settings shared by the HTTP providers.
struct HttpSettings {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpSettings {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    /// POST `body` to `url`, retrying rate limits, server errors and
    /// connection failures.
    async fn post_json(
        &self,
        provider: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(provider, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("{} API error {}: {}", provider, status, body_text));
                        continue;
                    }
                    bail!("{} API error {}: {}", provider, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", provider, url, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", provider)))
    }
}

// ============ OpenAI ============

/// Embeddings from the OpenAI API or any server speaking its protocol.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    batch_size: usize,
    http: HttpSettings,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_URL.to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            batch_size: config.batch_size.max(1),
            http: HttpSettings::new(config)?,
        })
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .http
            .post_json(
                "OpenAI",
                &format!("{}/embeddings", self.url),
                Some(&self.api_key),
                &body,
            )
            .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| unavailable("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let vectors = self.embed_chunk(chunk).await.map_err(|e| {
                warn!(error = %e, "OpenAI embedding failed");
                unavailable(format!("{e:#}"))
            })?;
            if vectors.len() != chunk.len() {
                return Err(unavailable(format!(
                    "expected {} embeddings, got {}",
                    chunk.len(),
                    vectors.len()
                )));
            }
            out.extend(vectors);
        }
        check_dims(&out, self.dims)?;
        Ok(out)
    }
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    http: HttpSettings,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_URL.to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            batch_size: config.batch_size.max(1),
            http: HttpSettings::new(config)?,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            Ok(embedding
                .as_array()
                .ok_or_else(|| anyhow!("invalid Ollama response: embedding is not an array"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| unavailable("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let endpoint = format!("{}/api/embed", self.url);
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": chunk,
            });
            let vectors = self
                .http
                .post_json("Ollama", &endpoint, None, &body)
                .await
                .and_then(|json| parse_ollama_response(&json))
                .map_err(|e| {
                    warn!(error = %e, url = %self.url, "Ollama embedding failed");
                    unavailable(format!("{e:#}"))
                })?;
            out.extend(vectors);
        }
        check_dims(&out, self.dims)?;
        Ok(out)
    }
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings")]
mod local {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;

    use strata_core::embedding::{check_dims, Embedder};
    use strata_core::error::EngineResult;

    use super::unavailable;
    use crate::config::EmbeddingConfig;

    /// In-process embeddings via fastembed. Models are downloaded from
    /// Hugging Face on first use and cached; the loaded model is kept for
    /// the lifetime of the embedder.
    pub struct LocalEmbedder {
        model_name: String,
        dims: usize,
        batch_size: usize,
        variant: fastembed::EmbeddingModel,
        model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            let variant = fastembed_model(&model_name)?;
            let dims = config.dims.unwrap_or(match model_name.as_str() {
                "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
                "bge-large-en-v1.5" => 1024,
                _ => 384,
            });
            Ok(Self {
                model_name,
                dims,
                batch_size: config.batch_size.max(1),
                variant,
                model: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            other => bail!(
                "unknown local embedding model '{}'; supported: all-minilm-l6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1, nomic-embed-text-v1.5",
                other
            ),
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
            self.embed_batch(&[text.to_string()])
                .await?
                .pop()
                .ok_or_else(|| unavailable("empty embedding response"))
        }

        async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            let model = Arc::clone(&self.model);
            let variant = self.variant.clone();
            let batch_size = self.batch_size;
            let texts = texts.to_vec();

            let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut slot = model.lock().unwrap_or_else(|e| e.into_inner());
                if slot.is_none() {
                    let loaded = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(variant).with_show_download_progress(false),
                    )
                    .map_err(|e| anyhow!("failed to initialize local embedding model: {}", e))?;
                    *slot = Some(loaded);
                }
                let Some(embedder) = slot.as_mut() else {
                    bail!("local embedding model not loaded");
                };
                embedder
                    .embed(texts, Some(batch_size))
                    .map_err(|e| anyhow!("local embedding failed: {}", e))
            })
            .await
            .map_err(unavailable)?
            .map_err(|e| unavailable(format!("{e:#}")))?;

            check_dims(&vectors, self.dims)?;
            Ok(vectors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_provider_yields_no_embedder() {
        let config = EmbeddingConfig::default();
        assert!(create_embedder(&config).unwrap().is_none());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "cohere".into(),
            ..EmbeddingConfig::default()
        };
        let err = create_embedder(&config).err().unwrap();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn ollama_requires_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());

        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            url: Some("http://127.0.0.1:1/".into()),
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).unwrap().unwrap();
        assert_eq!(embedder.model_name(), "nomic-embed-text");
        assert_eq!(embedder.dims(), 768);
    }

    #[test]
    fn openai_response_is_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.25], [1.0, 0.0]] });
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.5, 0.25]);
        assert!(parse_ollama_response(&serde_json::json!({ "embeddings": [1] })).is_err());
    }

    #[tokio::test]
    async fn unreachable_ollama_is_an_outage() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(2),
            url: Some("http://127.0.0.1:1".into()),
            max_retries: 0,
            timeout_secs: 2,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(err.is_capability_outage());
    }
}
