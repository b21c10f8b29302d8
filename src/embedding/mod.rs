//! Embedding generation against an external embedding endpoint
//!
//! The broker embeds tool descriptions and retrieval queries through an
//! OpenAI-compatible `/embeddings` endpoint. Vectors are unit-normalized
//! before they are handed to the vector store, so cosine similarity reduces
//! to a dot product over stored rows.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{DextError, Result};

/// Default endpoint root (Volcengine Ark)
pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";

/// Default embedding model
pub const DEFAULT_MODEL_NAME: &str = "doubao-embedding-text-240715";

/// Default output dimension
pub const DEFAULT_DIMENSION: usize = 1024;

/// Embedding endpoint configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model_name: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            dimension: DEFAULT_DIMENSION,
        }
    }
}

/// Trait for embedding generators
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embeddings for a batch of texts, same length and order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate an embedding for a single text
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| DextError::Upstream("embedding endpoint returned no vector".into()))
    }

    /// Declared output dimension
    fn dimension(&self) -> usize;

    /// Model identifier recorded alongside each vector
    fn model_name(&self) -> &str;
}

/// HTTP client for an OpenAI-compatible embedding endpoint
#[derive(Debug)]
pub struct ArkEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model_name: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl ArkEmbedder {
    /// Build a client; fails with `ConfigMissing` when no API key is set
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                DextError::ConfigMissing("EMBEDDING_API_KEY is required to embed".into())
            })?
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model_name: config.model_name.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl Embedder for ArkEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model_name,
                "input": texts,
                "encoding_format": "float",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            return Err(DextError::Upstream(format!(
                "embedding endpoint returned {status}: {snippet}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(DextError::Upstream(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(data.len());
        for datum in data {
            if datum.embedding.len() != self.dimension {
                return Err(DextError::Shape {
                    expected: self.dimension,
                    actual: datum.embedding.len(),
                });
            }
            vectors.push(normalize(datum.embedding));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Scale a vector to unit length; zero vectors are returned unchanged
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
