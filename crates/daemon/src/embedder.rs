// crates/daemon/src/embedder.rs
//! Embedding providers behind the `Embedder` trait.
//!
//! Ollama speaks its native `/api/embed` endpoint; OpenAI and OpenRouter
//! share the `/v1/embeddings` wire format and differ only in base URL and
//! key. A missing provider is a degraded condition (`DependencyMissing`):
//! semantic search and clustering skip, ingestion continues.

use async_trait::async_trait;
use pi_brain_core::config::{DaemonConfig, EmbeddingProvider};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Embedding request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Embedding provider returned an unexpected response: {0}")]
    BadResponse(String),

    #[error("Embedding provider returned {returned} vectors for {requested} inputs")]
    CountMismatch { requested: usize, returned: usize },
}

/// Seam for embedding providers; mocked in maintenance tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn model(&self) -> &str;

    /// Expected dimensionality, when the provider declares one.
    fn dimensions(&self) -> Option<usize>;
}

/// Ollama local embedding endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: Option<usize>,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimensions: Option<usize>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        }
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(60))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?
            .error_for_status()?;
        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::BadResponse(e.to_string()))?;
        if body.embeddings.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                requested: texts.len(),
                returned: body.embeddings.len(),
            });
        }
        Ok(body.embeddings)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}

/// OpenAI-compatible embeddings endpoint (OpenAI, OpenRouter).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: Option<usize>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbeddingRow>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .timeout(Duration::from_secs(60))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?
            .error_for_status()?;
        let body: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::BadResponse(e.to_string()))?;
        if body.data.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                requested: texts.len(),
                returned: body.data.len(),
            });
        }
        // The API is free to reorder; indexes restore input order.
        let mut rows = body.data;
        rows.sort_by_key(|row| row.index);
        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}

/// Build an embedder from config. `None` when no provider is configured or
/// a required key is absent — callers degrade gracefully.
pub fn embedder_from_config(config: &DaemonConfig) -> Option<Box<dyn Embedder>> {
    let provider = config.embedding_provider?;
    let model = config.embedding_model.clone()?;
    match provider {
        EmbeddingProvider::Ollama => {
            let base = config
                .embedding_base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            info!(model = %model, "embedding via ollama");
            Some(Box::new(OllamaEmbedder::new(
                base,
                model,
                config.embedding_dimensions,
            )))
        }
        EmbeddingProvider::Openai | EmbeddingProvider::Openrouter => {
            let api_key = config.embedding_api_key.clone()?;
            let base = config.embedding_base_url.clone().unwrap_or_else(|| {
                match provider {
                    EmbeddingProvider::Openrouter => "https://openrouter.ai/api/v1".to_string(),
                    _ => "https://api.openai.com/v1".to_string(),
                }
            });
            info!(model = %model, provider = ?provider, "embedding via openai-compatible API");
            Some(Box::new(OpenAiEmbedder::new(
                base,
                api_key,
                model,
                config.embedding_dimensions,
            )))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{embed_one, FakeEmbedder};
    use super::*;
    use pi_brain_core::config::Config;

    #[test]
    fn test_embedder_from_config_none_without_provider() {
        let config = Config::default();
        assert!(embedder_from_config(&config.daemon).is_none());
    }

    #[test]
    fn test_embedder_from_config_ollama_needs_no_key() {
        let config: Config = serde_yaml::from_str(
            "daemon:\n  embeddingProvider: ollama\n  embeddingModel: nomic-embed-text\n",
        )
        .unwrap();
        let embedder = embedder_from_config(&config.daemon).expect("ollama without key");
        assert_eq!(embedder.model(), "nomic-embed-text");
    }

    #[test]
    fn test_embedder_from_config_openai_requires_key() {
        let config: Config = serde_yaml::from_str(
            "daemon:\n  embeddingProvider: openai\n  embeddingModel: text-embedding-3-small\n",
        )
        .unwrap();
        assert!(embedder_from_config(&config.daemon).is_none(), "no key, no embedder");

        let config: Config = serde_yaml::from_str(
            "daemon:\n  embeddingProvider: openai\n  embeddingModel: text-embedding-3-small\n  embeddingApiKey: k\n",
        )
        .unwrap();
        assert!(embedder_from_config(&config.daemon).is_some());
    }

    #[tokio::test]
    async fn test_fake_embedder_is_deterministic_and_normalized() {
        let embedder = FakeEmbedder { dims: 16 };
        let vectors = embedder
            .embed(&["alpha beta".to_string(), "alpha beta".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vectors[1]);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_texts_are_closer_than_dissimilar() {
        let a = embed_one("watcher debounce race", 32);
        let b = embed_one("watcher debounce bug", 32);
        let c = embed_one("unrelated cooking recipe", 32);
        let sim_ab = pi_brain_db::cosine_similarity(&a, &b);
        let sim_ac = pi_brain_db::cosine_similarity(&a, &c);
        assert!(sim_ab > sim_ac);
    }
}
