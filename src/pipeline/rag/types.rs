/// Number of characters of the neighbor's raw text quoted in the context.
pub const SNIPPET_CHARS: usize = 1000;

/// Result of building retrieval context for one document.
#[derive(Debug, Clone, Default)]
pub struct RagBuild {
    /// Formatted hint block, or `None` when no usable neighbor exists.
    pub context: Option<String>,
    /// Embedding of the current text; `None` only if embedding failed.
    pub embedding: Option<Vec<f32>>,
    /// Set when an enrichment step failed.
    pub failure: Option<RagFailure>,
}

/// Which enrichment step degraded.
#[derive(Debug, Clone, PartialEq)]
pub enum RagFailure {
    Embedding(String),
    SimilarityQuery(String),
}

impl std::fmt::Display for RagFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedding(e) => write!(f, "embedding failed: {e}"),
            Self::SimilarityQuery(e) => write!(f, "similarity query failed: {e}"),
        }
    }
}
