//! Embedding client.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! disabled, OpenAI-compatible HTTP, Ollama, and a local on-device model
//! (fastembed by default, tract-onnx as a pure-Rust fallback feature).
//!
//! Per the design, `embed_batch` fails as a whole on any error and performs
//! **no internal retry** — the caller (ingestion pipeline, searcher) decides
//! whether and how to retry. A separate [`probe_availability`] call supports
//! the startup model-availability check.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{ConduitError, Result};

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed a batch of texts. Fails as a whole; no internal retry.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Startup / periodic availability probe.
    async fn probe_availability(&self) -> Result<()>;
}

pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed_batch(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| ConduitError::EmbedBatchFailed("empty embedding response".into()))
}

/// Construct the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
        "local" => Err(ConduitError::Other(anyhow::anyhow!(
            "local embedding provider requires a local-embeddings-* feature"
        ))),
        other => Err(ConduitError::Other(anyhow::anyhow!(
            "unknown embedding provider: {other}"
        ))),
    }
}

// ============ Disabled provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(ConduitError::SemanticUnavailable(
            "embedding provider is disabled".into(),
        ))
    }
    async fn probe_availability(&self) -> Result<()> {
        Err(ConduitError::SemanticUnavailable(
            "embedding provider is disabled".into(),
        ))
    }
}

// ============ OpenAI-compatible provider ============

pub struct OpenAIProvider {
    model: String,
    dims: usize,
    timeout_secs: u64,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConduitError::Other(anyhow::anyhow!("embedding.model required")))?;
        let dims = config
            .dims
            .ok_or_else(|| ConduitError::Other(anyhow::anyhow!("embedding.dims required")))?;
        Ok(Self {
            model,
            dims,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConduitError::SemanticUnavailable("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ConduitError::Other(e.into()))?;

        let body = serde_json::json!({ "model": self.model, "input": texts });

        let response = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ConduitError::EmbedBatchFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ConduitError::EmbedBatchFailed(format!(
                "OpenAI API error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ConduitError::EmbedBatchFailed(e.to_string()))?;
        parse_openai_response(&json)
    }

    async fn probe_availability(&self) -> Result<()> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(ConduitError::SemanticUnavailable(
                "OPENAI_API_KEY not set".into(),
            ));
        }
        Ok(())
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ConduitError::EmbedBatchFailed("missing data array".into()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ConduitError::EmbedBatchFailed("missing embedding field".into()))?;
        embeddings.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(embeddings)
}

// ============ Ollama provider ============

pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ConduitError::Other(anyhow::anyhow!("embedding.model required")))?;
        let dims = config
            .dims
            .ok_or_else(|| ConduitError::Other(anyhow::anyhow!("embedding.dims required")))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            dims,
            url,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ConduitError::Other(e.into()))?;

        let body = serde_json::json!({ "model": self.model, "input": texts });

        let response = client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ConduitError::EmbedBatchFailed(format!(
                    "Ollama connection error (is it running at {}?): {e}",
                    self.url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ConduitError::EmbedBatchFailed(format!(
                "Ollama API error {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ConduitError::EmbedBatchFailed(e.to_string()))?;
        parse_ollama_response(&json)
    }

    async fn probe_availability(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConduitError::Other(e.into()))?;
        client
            .get(format!("{}/api/tags", self.url))
            .send()
            .await
            .map_err(|e| ConduitError::SemanticUnavailable(e.to_string()))?;
        Ok(())
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ConduitError::EmbedBatchFailed("missing embeddings array".into()))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| ConduitError::EmbedBatchFailed("embedding is not an array".into()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

// ============ Local provider (fastembed / tract) ============

#[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    #[cfg(feature = "local-embeddings-fastembed")]
    batch_size: usize,
}

#[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "all-minilm-l6-v2" => 384,
            "bge-small-en-v1.5" => 384,
            "bge-base-en-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            #[cfg(feature = "local-embeddings-fastembed")]
            batch_size: config.batch_size,
        })
    }
}

#[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let fastembed_model = config_to_fastembed_model(&self.model_name)?;
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
            )
            .map_err(|e| ConduitError::EmbedBatchFailed(format!("model init failed: {e}")))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| ConduitError::EmbedBatchFailed(format!("local embed failed: {e}")))
        })
        .await
        .map_err(|e| ConduitError::Other(e.into()))?
    }

    #[cfg(all(feature = "local-embeddings-tract", not(feature = "local-embeddings-fastembed")))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        local_tract::embed_local_tract(&self.model_name, self.dims, texts).await
    }

    async fn probe_availability(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(ConduitError::Other(anyhow::anyhow!(
            "unknown local embedding model: {other}"
        ))),
    }
}

// ============ Vector utilities ============

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_fails_every_call() {
        let provider = DisabledProvider;
        assert!(provider.embed_batch(&["x".into()]).await.is_err());
        assert!(provider.probe_availability().await.is_err());
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn create_provider_rejects_unknown_name() {
        let mut cfg = EmbeddingConfig::default();
        cfg.provider = "nonsense".into();
        assert!(create_provider(&cfg).is_err());
    }
}
