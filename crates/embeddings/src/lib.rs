//! Embedding providers.
//!
//! Selection is config-driven: the OpenAI embeddings API, a local
//! sentence-transformers HTTP service, or (when neither is configured) a
//! deterministic hash projection that keeps the pipeline operable in a
//! degraded mode.  The vector dimension is whatever the chosen provider
//! returns; nothing here pads or truncates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::warn;

use engram_config::EmbeddingConfig;

/// Dimension of the hash-fallback vectors.
pub const FALLBACK_DIMENSION: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embedding.  Providers without a native batch endpoint inherit
    /// this serial loop.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// True only for the hash fallback.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Pick the provider named by `embedding.service`.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.service.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "sentence-transformers" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        "fallback" | "" => {
            warn!("no embedding provider configured — using degraded hash fallback");
            Ok(Arc::new(HashEmbedder::new(FALLBACK_DIMENSION)))
        }
        other => bail!("unknown embedding service '{other}'"),
    }
}

// ── OpenAI ───────────────────────────────────────────────────────────────────

/// Cloud provider: `POST /embeddings` with native batch support.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .context("embedding credential missing: set OPENAI_API_KEY")?;

        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&json!({ "model": self.model, "input": inputs }))
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("embedding response unreadable")?;
        if !status.is_success() {
            bail!("embedding service returned {status}: {body}");
        }

        let data = body
            .get("data")
            .and_then(|data| data.as_array())
            .with_context(|| format!("embedding response missing data: {body}"))?;
        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let values = item
                .get("embedding")
                .and_then(|embedding| embedding.as_array())
                .context("embedding entry missing vector")?;
            vectors.push(
                values
                    .iter()
                    .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let mut vectors = self.request(&input).await?;
        vectors
            .pop()
            .context("embedding response contained no vectors")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            vectors.extend(self.request(chunk).await?);
        }
        Ok(vectors)
    }
}

// ── Local service ────────────────────────────────────────────────────────────

/// Local sentence-transformers sidecar: `POST {url}/embed` with
/// `{"texts": […]}` → `{"embeddings": [[…], …]}`.
pub struct LocalEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            url: config.url.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let mut vectors = self.embed_batch(&input).await?;
        vectors
            .pop()
            .context("local embedding service returned no vectors")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/embed", self.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&endpoint)
            .json(&json!({ "model": self.model, "texts": texts }))
            .send()
            .await
            .context("local embedding request failed")?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .context("local embedding response unreadable")?;
        if !status.is_success() {
            bail!("local embedding service returned {status}: {body}");
        }

        let rows = body
            .get("embeddings")
            .and_then(|embeddings| embeddings.as_array())
            .with_context(|| format!("local embedding response missing embeddings: {body}"))?;
        Ok(rows
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }
}

// ── Hash fallback ────────────────────────────────────────────────────────────

/// Deterministic degraded-mode embedder.
///
/// Each whitespace token is hashed with SHA-256 and scattered into a few
/// buckets of a fixed-dimension vector, which is then L2-normalised.  Equal
/// texts always produce equal vectors, so retrieval stays self-consistent
/// even though semantic quality is poor.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            // Four buckets per token, signed by the following byte.
            for pair in digest.chunks(8).take(4) {
                let mut index_bytes = [0u8; 4];
                index_bytes.copy_from_slice(&pair[..4]);
                let index = u32::from_le_bytes(index_bytes) as usize % self.dimension;
                let sign = if pair[4] & 1 == 0 { 1.0 } else { -1.0 };
                vector[index] += sign;
            }
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.project(text))
    }

    fn is_degraded(&self) -> bool {
        true
    }
}
