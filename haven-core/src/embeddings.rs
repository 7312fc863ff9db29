//! Pluggable embedding providers for query vectorization.
//!
//! Trait-based abstraction over embedding backends: a local hashing
//! embedder that is always available (used by tests and offline mode) and
//! an HTTP embedder for OpenAI-compatible `/embeddings` endpoints.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;

use crate::error::RetrievalError;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Local term-frequency hashing embedder (no external dependencies).
///
/// Hashes each term into a fixed-size vector and L2-normalizes, so cosine
/// similarity degrades to term overlap. Good enough for offline mode and
/// deterministic tests, not for production recall.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn term_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

impl HashEmbedder {
    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if words.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = term_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local-hash"
    }
}

/// HTTP embedder for OpenAI-compatible `/embeddings` endpoints.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!("{}/embeddings", self.base_url);
        debug!(url = %url, model = %self.model, "Requesting embedding");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding {
                message: format!("Request failed: {e}"),
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| RetrievalError::Embedding {
            message: format!("Invalid JSON: {e}"),
        })?;

        if !status.is_success() {
            return Err(RetrievalError::Embedding {
                message: format!("HTTP {status}: {body}"),
            });
        }

        let values = body
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|e| e.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| RetrievalError::Embedding {
                message: "Response missing data[0].embedding".into(),
            })?;

        Ok(values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "http"
    }
}

/// Cosine similarity between two vectors of the same dimensionality.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("anxiety and stress").await.unwrap();
        let b = embedder.embed("anxiety and stress").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_hash_embedder_normalized() {
        let embedder = HashEmbedder::new(64);
        let v = embedder.embed("breathing exercises help").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedder_empty_text() {
        let embedder = HashEmbedder::new(64);
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_similar_texts_score_higher() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed("managing anxiety at school").await.unwrap();
        let close = embedder
            .embed("tips for managing anxiety during school hours")
            .await
            .unwrap();
        let far = embedder.embed("volcanoes erupt molten rock").await.unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
    }
}
