use super::StructuringError;
use crate::pipeline::cache::FieldMap;

/// Abstraction over LLM backends (allows mocking for tests).
pub trait LlmClient {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<String, StructuringError>;

    fn is_model_available(&self, model: &str) -> Result<bool, StructuringError>;

    fn list_models(&self) -> Result<Vec<String>, StructuringError>;
}

/// Extracts named fields from document text.
///
/// Implementations must return exactly the requested keys; every value is
/// either a trimmed non-empty string or `None`.
pub trait FieldExtractor {
    fn extract_fields(
        &self,
        label: &str,
        keys: &[String],
        text: &str,
        rag_context: Option<&str>,
    ) -> Result<FieldMap, StructuringError>;
}
