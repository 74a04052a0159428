use serde::{Deserialize, Serialize};

use super::StorageError;

/// Metadata stored next to each document embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Full raw text of the document.
    pub raw_text: String,
    /// JSON object of the fields extracted for the request that registered it.
    pub extracted_fields_json: String,
    pub label: String,
    /// JSON array of the field names requested at registration time.
    pub requested_fields_json: String,
}

/// A query hit: cosine distance (0 = identical direction) plus stored metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: f32,
    pub metadata: IndexMetadata,
}

/// Embedding model abstraction
pub trait EmbeddingModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError>;
    fn dimension(&self) -> usize;
}

/// Similarity index abstraction with one namespace per document label.
///
/// Queries never return records from another namespace.
pub trait SimilarityIndex {
    /// Insert a record; an existing id in the same namespace is replaced.
    fn add(
        &self,
        label: &str,
        id: &str,
        embedding: &[f32],
        metadata: IndexMetadata,
    ) -> Result<(), StorageError>;

    /// Up to `k` records closest to `embedding`, nearest first.
    fn query_nearest(
        &self,
        label: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, StorageError>;

    /// Number of records in a namespace.
    fn count(&self, label: &str) -> usize;

    /// The single nearest record, if the namespace has any.
    fn nearest(&self, label: &str, embedding: &[f32]) -> Result<Option<Neighbor>, StorageError> {
        Ok(self.query_nearest(label, embedding, 1)?.into_iter().next())
    }
}

/// Cosine distance `1 - cos(a, b)`. Zero vectors are maximally distant
/// from everything (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    // Rounding can push identical vectors slightly below zero.
    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0)
}
