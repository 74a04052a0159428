use super::types::{RagBuild, RagFailure, SNIPPET_CHARS};
use crate::pipeline::storage::{EmbeddingModel, Neighbor, SimilarityIndex};

/// Finds the most similar prior document of the same label and formats it
/// as a hint for the field extractor.
///
/// Retrieval is an optimization: every failure degrades to "no context".
pub struct RagContextBuilder<'a> {
    embedder: &'a dyn EmbeddingModel,
    index: &'a dyn SimilarityIndex,
}

impl<'a> RagContextBuilder<'a> {
    pub fn new(embedder: &'a dyn EmbeddingModel, index: &'a dyn SimilarityIndex) -> Self {
        Self { embedder, index }
    }

    /// Embed `current_text` and look up its nearest neighbor in `label`'s namespace.
    pub fn build(&self, label: &str, current_text: &str) -> RagBuild {
        let embedding = match self.embedder.embed(current_text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(label = %label, error = %e, "Embedding failed, continuing without context");
                return RagBuild {
                    failure: Some(RagFailure::Embedding(e.to_string())),
                    ..Default::default()
                };
            }
        };

        match self.index.nearest(label, &embedding) {
            Ok(Some(neighbor)) => {
                tracing::debug!(
                    label = %label,
                    neighbor = %neighbor.id,
                    distance = neighbor.distance,
                    "Found similar prior document"
                );
                RagBuild {
                    context: Some(format_context(&neighbor)),
                    embedding: Some(embedding),
                    failure: None,
                }
            }
            Ok(None) => RagBuild {
                context: None,
                embedding: Some(embedding),
                failure: None,
            },
            Err(e) => {
                tracing::warn!(label = %label, error = %e, "Similarity query failed, continuing without context");
                RagBuild {
                    context: None,
                    embedding: Some(embedding),
                    failure: Some(RagFailure::SimilarityQuery(e.to_string())),
                }
            }
        }
    }
}

/// Fixed-structure context block for a neighbor.
pub fn format_context(neighbor: &Neighbor) -> String {
    let meta = &neighbor.metadata;
    let snippet: String = meta.raw_text.chars().take(SNIPPET_CHARS).collect();

    format!(
        "[SIMILARITY_DISTANCE]: {:.4}\n\n\
         [LABEL]: {}\n\n\
         [PAST_REQUESTED_FIELDS]: {}\n\n\
         [PAST_TEXT_SNIPPET]:\n{}\n\n\
         [PAST_EXTRACTION_JSON]:\n{}\n",
        neighbor.distance, meta.label, meta.requested_fields_json, snippet, meta.extracted_fields_json,
    )
}
