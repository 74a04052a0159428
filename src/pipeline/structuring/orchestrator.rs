use std::time::Instant;

use super::parser::{project_fields, try_parse_json};
use super::prompt::{build_extraction_prompt, FIELD_EXTRACTION_SYSTEM_PROMPT};
use super::types::{FieldExtractor, LlmClient};
use super::StructuringError;
use crate::pipeline::cache::FieldMap;

/// Extra attempts after a transient LLM failure.
const MAX_LLM_RETRIES: usize = 1;

/// Field extractor backed by an LLM: prompt → generate → recover JSON → normalize.
pub struct LlmFieldExtractor {
    llm: Box<dyn LlmClient + Send + Sync>,
    model_name: String,
}

impl LlmFieldExtractor {
    pub fn new(llm: Box<dyn LlmClient + Send + Sync>, model_name: &str) -> Self {
        Self {
            llm,
            model_name: model_name.to_string(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn llm(&self) -> &(dyn LlmClient + Send + Sync) {
        self.llm.as_ref()
    }

    fn generate_with_retry(&self, prompt: &str) -> Result<String, StructuringError> {
        let mut attempt = 0;
        loop {
            match self
                .llm
                .generate(&self.model_name, prompt, FIELD_EXTRACTION_SYSTEM_PROMPT)
            {
                Ok(resp) => return Ok(resp),
                Err(e) if is_retryable_error(&e) && attempt < MAX_LLM_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "LLM call failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Timeouts and server-side failures may succeed on a second try; a refused
/// connection or a client error will not.
fn is_retryable_error(e: &StructuringError) -> bool {
    match e {
        StructuringError::HttpClient(_) => true,
        StructuringError::OllamaError { status, .. } => *status >= 500,
        _ => false,
    }
}

impl FieldExtractor for LlmFieldExtractor {
    fn extract_fields(
        &self,
        label: &str,
        keys: &[String],
        text: &str,
        rag_context: Option<&str>,
    ) -> Result<FieldMap, StructuringError> {
        let prompt = build_extraction_prompt(label, keys, text, rag_context);

        let started = Instant::now();
        let raw = self.generate_with_retry(&prompt)?;
        tracing::debug!(
            label = %label,
            model = %self.model_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "LLM inference complete"
        );

        let parsed = try_parse_json(&raw);
        if parsed.is_empty() && !keys.is_empty() {
            tracing::warn!(label = %label, "LLM response held no JSON object, fields resolve to null");
        }

        Ok(project_fields(&parsed, keys))
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestration
// ═══════════════════════════════════════════════════════════

/// Decides which fields need extraction and guarantees the shape of what
/// comes back.
pub struct ExtractionOrchestrator {
    extractor: Box<dyn FieldExtractor + Send + Sync>,
}

impl ExtractionOrchestrator {
    pub fn new(extractor: Box<dyn FieldExtractor + Send + Sync>) -> Self {
        Self { extractor }
    }

    /// Extract exactly `missing_keys`.
    ///
    /// No call is made for an empty key list. The result holds every
    /// requested key and nothing else, whatever the extractor returned.
    pub fn extract(
        &self,
        label: &str,
        missing_keys: &[String],
        text: &str,
        rag_context: Option<&str>,
    ) -> Result<FieldMap, StructuringError> {
        if missing_keys.is_empty() {
            return Ok(FieldMap::new());
        }

        let mut returned = self
            .extractor
            .extract_fields(label, missing_keys, text, rag_context)?;

        let shaped: FieldMap = missing_keys
            .iter()
            .map(|k| (k.clone(), returned.remove(k).flatten()))
            .collect();

        if !returned.is_empty() {
            tracing::debug!(label = %label, extra = returned.len(), "Dropped unrequested fields");
        }

        Ok(shaped)
    }
}

/// Split requested keys into those already cached and those still unknown.
///
/// Presence decides: a cached `None` counts as present.
pub fn partition_keys(requested: &[String], cached: &FieldMap) -> (Vec<String>, Vec<String>) {
    requested
        .iter()
        .cloned()
        .partition(|k| cached.contains_key(k))
}

/// The caller's view: exactly the requested keys, unknown ones as `None`.
pub fn requested_view(requested: &[String], fields: &FieldMap) -> FieldMap {
    requested
        .iter()
        .map(|k| (k.clone(), fields.get(k).cloned().flatten()))
        .collect()
}
