use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::types::EmbeddingModel;
use super::StorageError;

/// Dimension of the offline hashing embedder.
pub const EMBEDDING_DIM: usize = 384;

// ═══════════════════════════════════════════════════════════
// Ollama embedder
// ═══════════════════════════════════════════════════════════

/// Embedding model served by a local Ollama instance (`/api/embeddings`).
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    /// Learned from the first successful response.
    dimension: AtomicUsize,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            dimension: AtomicUsize::new(0),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl EmbeddingModel for OllamaEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| StorageError::Embedding(format!("Ollama request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StorageError::Embedding(format!(
                "Ollama returned status {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .map_err(|e| StorageError::Embedding(format!("Malformed embedding response: {e}")))?;

        if parsed.embedding.is_empty() {
            return Err(StorageError::Embedding("Empty embedding returned".into()));
        }

        self.dimension.store(parsed.embedding.len(), Ordering::Relaxed);
        Ok(parsed.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════
// Hashing embedder
// ═══════════════════════════════════════════════════════════

/// Offline embedder: feature-hashes lower-cased word tokens into a fixed
/// number of buckets, then L2-normalizes.
///
/// Deterministic across processes. Documents sharing vocabulary land close
/// together, which is enough for "most similar prior document" lookups in
/// tests and air-gapped deployments.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(EMBEDDING_DIM)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        Ok(hashed_vector(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn hashed_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dim];

    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let hash = fnv1a(token.to_lowercase().as_bytes());
        let bucket = (hash % dim as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign;
    }

    // L2 normalize
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in &mut vec {
            *val /= norm;
        }
    }

    vec
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |h, b| (h ^ *b as u64).wrapping_mul(PRIME))
}
