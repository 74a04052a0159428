//! Document Processing Orchestrator.
//!
//! Single entry point that drives one document through the pipeline:
//! identify → cache lookup → (retrieve context → extract missing fields) →
//! register in the similarity index (once) → write back.
//!
//! Every external collaborator sits behind a trait so the orchestrator is
//! testable with mock implementations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{EmbedderKind, IndexLocation, Settings};
use crate::pipeline::cache::{
    compute_signature_with, make_key, CacheEntry, DocumentCache, DocumentKey, FieldMap,
    SignatureMode, DEFAULT_HYBRID_BYTES,
};
use crate::pipeline::extraction::{PdfTextExtractor, TextExtractor};
use crate::pipeline::rag::{RagContextBuilder, RagFailure};
use crate::pipeline::storage::{
    EmbeddingModel, FileSimilarityIndex, HashingEmbedder, InMemorySimilarityIndex, IndexMetadata,
    OllamaEmbedder, SimilarityIndex, StorageError,
};
use crate::pipeline::structuring::{
    partition_keys, requested_view, ExtractionOrchestrator, FieldExtractor, LlmFieldExtractor,
    OllamaClient,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can escape document processing.
///
/// Everything else degrades to null fields plus a [`PipelineWarning`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Processing cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// One document to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRequest {
    /// Position in the caller's batch, used as a fallback identifier.
    pub index: usize,
    pub label: String,
    /// Its key set defines the requested fields; values are ignored.
    pub extraction_schema: serde_json::Map<String, serde_json::Value>,
    pub pdf_path: PathBuf,
    /// Pre-extracted text. When set the file is not read.
    pub text: Option<String>,
}

impl SampleRequest {
    pub fn new(index: usize, label: &str, pdf_path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            label: label.to_string(),
            extraction_schema: serde_json::Map::new(),
            pdf_path: pdf_path.into(),
            text: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extraction_schema = schema;
        self
    }

    /// Schema with the given keys and empty descriptions.
    pub fn with_fields(mut self, keys: &[&str]) -> Self {
        self.extraction_schema = keys
            .iter()
            .map(|k| (k.to_string(), serde_json::Value::String(String::new())))
            .collect();
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn requested_keys(&self) -> Vec<String> {
        self.extraction_schema.keys().cloned().collect()
    }
}

/// The response unit: exactly the requested fields for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub label: String,
    pub pdf_filename: String,
    pub requested_fields: FieldMap,
}

/// How much of the request the cache could answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    HitAll,
    HitPartial,
    Miss,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HitAll => "hit_all",
            Self::HitPartial => "hit_partial",
            Self::Miss => "miss",
        }
    }
}

/// A degraded step that did not abort processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum PipelineWarning {
    TextExtractionFailed(String),
    EmbeddingFailed(String),
    SimilarityQueryFailed(String),
    RegistrationFailed(String),
    ExtractionFailed(String),
}

impl From<RagFailure> for PipelineWarning {
    fn from(failure: RagFailure) -> Self {
        match failure {
            RagFailure::Embedding(e) => Self::EmbeddingFailed(e),
            RagFailure::SimilarityQuery(e) => Self::SimilarityQueryFailed(e),
        }
    }
}

/// Detailed result of processing one document.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    pub payload: ResultPayload,
    pub cache: CacheOutcome,
    /// This call inserted the document into the similarity index.
    pub registered_now: bool,
    pub warnings: Vec<PipelineWarning>,
}

/// Shared cancellation flag, checked at every external call boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ProcessingError> {
        if self.is_cancelled() {
            Err(ProcessingError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Processes documents against a shared cache and similarity index.
///
/// Safe to share across threads. Concurrent calls for the same document are
/// not serialized; the worst case is duplicate extraction work.
pub struct DocumentPipeline {
    cache: DocumentCache,
    text_extractor: Box<dyn TextExtractor + Send + Sync>,
    embedder: Box<dyn EmbeddingModel + Send + Sync>,
    index: Box<dyn SimilarityIndex + Send + Sync>,
    orchestrator: ExtractionOrchestrator,
    signature_mode: SignatureMode,
    hybrid_bytes: u64,
}

impl DocumentPipeline {
    pub fn new(
        text_extractor: Box<dyn TextExtractor + Send + Sync>,
        embedder: Box<dyn EmbeddingModel + Send + Sync>,
        index: Box<dyn SimilarityIndex + Send + Sync>,
        field_extractor: Box<dyn FieldExtractor + Send + Sync>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            cache: DocumentCache::new(cache_capacity),
            text_extractor,
            embedder,
            index,
            orchestrator: ExtractionOrchestrator::new(field_extractor),
            signature_mode: SignatureMode::Fast,
            hybrid_bytes: DEFAULT_HYBRID_BYTES,
        }
    }

    pub fn with_signature_mode(mut self, mode: SignatureMode, hybrid_bytes: u64) -> Self {
        self.signature_mode = mode;
        self.hybrid_bytes = hybrid_bytes;
        self
    }

    /// Wire the production collaborators described by `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self, StorageError> {
        let llm = OllamaClient::new(&settings.ollama_url, settings.llm_timeout_secs);
        let field_extractor = LlmFieldExtractor::new(Box::new(llm), &settings.llm_model);

        let embedder: Box<dyn EmbeddingModel + Send + Sync> = match settings.embedder {
            EmbedderKind::Ollama => Box::new(OllamaEmbedder::new(
                &settings.ollama_url,
                &settings.embedding_model,
                settings.llm_timeout_secs,
            )),
            EmbedderKind::Hashing => Box::new(HashingEmbedder::new()),
        };

        let index: Box<dyn SimilarityIndex + Send + Sync> = match &settings.index_location {
            IndexLocation::Memory => Box::new(InMemorySimilarityIndex::new()),
            IndexLocation::Dir(dir) => Box::new(FileSimilarityIndex::open(dir)?),
        };

        tracing::info!(
            capacity = settings.cache_capacity,
            signature_mode = %settings.signature_mode,
            index = %settings.index_location,
            embedder = settings.embedder.as_str(),
            model = %settings.llm_model,
            "Pipeline configured"
        );

        Ok(Self::new(
            Box::new(PdfTextExtractor),
            embedder,
            index,
            Box::new(field_extractor),
            settings.cache_capacity,
        )
        .with_signature_mode(settings.signature_mode, settings.hybrid_bytes))
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn index(&self) -> &dyn SimilarityIndex {
        self.index.as_ref()
    }

    pub fn signature_mode(&self) -> SignatureMode {
        self.signature_mode
    }

    /// Process one document and return only the payload.
    pub fn process_single_sample(
        &self,
        index: usize,
        label: &str,
        extraction_schema: &serde_json::Map<String, serde_json::Value>,
        pdf_path: &Path,
        text: Option<&str>,
    ) -> ResultPayload {
        let request = SampleRequest {
            index,
            label: label.to_string(),
            extraction_schema: extraction_schema.clone(),
            pdf_path: pdf_path.to_path_buf(),
            text: text.map(str::to_string),
        };

        match self.process(&request, &CancelToken::new()) {
            Ok(outcome) => outcome.payload,
            // A fresh token is never cancelled
            Err(ProcessingError::Cancelled) => ResultPayload {
                label: request.label.clone(),
                pdf_filename: split_pdf_path(&request.pdf_path).0,
                requested_fields: requested_view(&request.requested_keys(), &FieldMap::new()),
            },
        }
    }

    /// Process one document, reporting cache outcome and degraded steps.
    ///
    /// Cancellation is honored before every external call and before the
    /// cache write-back; a cancelled request leaves the cache untouched
    /// apart from stale-entry invalidation.
    pub fn process(
        &self,
        request: &SampleRequest,
        cancel: &CancelToken,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let label = request.label.as_str();
        let (pdf_filename, root) = split_pdf_path(&request.pdf_path);

        // Identify, then invalidate any entry for an older version of this file
        let signature =
            compute_signature_with(&root, &pdf_filename, self.signature_mode, self.hybrid_bytes);
        let doc_key = make_key(label, &pdf_filename, &signature);
        self.cache.upsert_latest_key(label, &pdf_filename, &doc_key);

        // A missing file never hits and is never stored
        let cacheable = !signature.is_missing();
        if !cacheable {
            tracing::debug!(label = %label, pdf = %pdf_filename, "File not found, bypassing cache");
        }

        let mut warnings = Vec::new();
        let text = self.load_text(request, &root, &pdf_filename, &mut warnings);

        let entry = if cacheable { self.cache.get(&doc_key) } else { None };
        let requested = request.requested_keys();
        let cached_fields = entry.as_ref().map(|e| e.fields().clone()).unwrap_or_default();
        let (present, missing) = partition_keys(&requested, &cached_fields);

        let doc_id = doc_id(&pdf_filename, request.index);
        let has_text = !text.trim().is_empty();

        if missing.is_empty() {
            tracing::info!(cache = "hit_all", label = %label, pdf = %pdf_filename, "Cache lookup");
            let view = requested_view(&requested, &cached_fields);

            // Blank text has nothing worth embedding; the entry stays unregistered
            let mut registered_now = false;
            if let Some(mut entry) = entry.filter(|e| !e.is_registered() && has_text) {
                cancel.check()?;
                match self.embedder.embed(&text) {
                    Ok(embedding) => {
                        cancel.check()?;
                        if self.register(label, &doc_id, &embedding, &text, &view, &requested, &mut warnings) {
                            entry.mark_registered();
                            cancel.check()?;
                            self.cache.put(doc_key, entry);
                            registered_now = true;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(label = %label, pdf = %pdf_filename, error = %e, "Embedding failed, registration deferred");
                        warnings.push(PipelineWarning::EmbeddingFailed(e.to_string()));
                    }
                }
            }

            return Ok(ProcessingOutcome {
                payload: ResultPayload {
                    label: label.to_string(),
                    pdf_filename,
                    requested_fields: view,
                },
                cache: CacheOutcome::HitAll,
                registered_now,
                warnings,
            });
        }

        let cache_outcome = if present.is_empty() {
            tracing::info!(cache = "miss", label = %label, pdf = %pdf_filename, "Cache lookup");
            CacheOutcome::Miss
        } else {
            tracing::info!(
                cache = "hit_partial",
                label = %label,
                pdf = %pdf_filename,
                present = ?present,
                missing = ?missing,
                "Cache lookup"
            );
            CacheOutcome::HitPartial
        };

        let mut entry =
            entry.unwrap_or_else(|| CacheEntry::new(label, &pdf_filename, signature.clone()));

        // Nothing to read: every missing field resolves to null without an LLM call
        let (new_fields, embedding, extraction_ok) = if !has_text {
            let nulls: FieldMap = missing.iter().map(|k| (k.clone(), None)).collect();
            (nulls, None, true)
        } else {
            cancel.check()?;
            let rag = RagContextBuilder::new(self.embedder.as_ref(), self.index.as_ref())
                .build(label, &text);
            if let Some(failure) = rag.failure {
                warnings.push(failure.into());
            }

            cancel.check()?;
            match self
                .orchestrator
                .extract(label, &missing, &text, rag.context.as_deref())
            {
                Ok(fields) => (fields, rag.embedding, true),
                Err(e) => {
                    tracing::warn!(label = %label, pdf = %pdf_filename, error = %e, "Field extraction failed");
                    warnings.push(PipelineWarning::ExtractionFailed(e.to_string()));
                    (FieldMap::new(), rag.embedding, false)
                }
            }
        };

        // Failed extractions are not cached, so the next call retries them
        entry.merge_fields(new_fields);
        let view = requested_view(&requested, entry.fields());

        // Register once, and only with a successful extraction as metadata
        let mut registered_now = false;
        if !entry.is_registered() && extraction_ok {
            if let Some(embedding) = &embedding {
                cancel.check()?;
                if self.register(label, &doc_id, embedding, &text, &view, &requested, &mut warnings) {
                    entry.mark_registered();
                    registered_now = true;
                }
            }
        }

        cancel.check()?;
        if cacheable {
            self.cache.put(doc_key, entry);
            let stats = self.cache.stats();
            tracing::debug!(
                size = stats.size,
                capacity = stats.capacity,
                tracked_files = stats.tracked_files,
                "Cache write-back"
            );
        }

        Ok(ProcessingOutcome {
            payload: ResultPayload {
                label: label.to_string(),
                pdf_filename,
                requested_fields: view,
            },
            cache: cache_outcome,
            registered_now,
            warnings,
        })
    }

    /// Use supplied text verbatim, else read the file. Read failures become
    /// empty text.
    fn load_text(
        &self,
        request: &SampleRequest,
        root: &Path,
        pdf_filename: &str,
        warnings: &mut Vec<PipelineWarning>,
    ) -> String {
        if let Some(text) = &request.text {
            return text.clone();
        }

        match self.text_extractor.extract_text(&root.join(pdf_filename)) {
            Ok(extracted) => extracted.text,
            Err(e) => {
                tracing::warn!(pdf = %pdf_filename, error = %e, "Failed to load PDF text");
                warnings.push(PipelineWarning::TextExtractionFailed(e.to_string()));
                String::new()
            }
        }
    }

    /// Insert the document into the similarity index. Returns whether it succeeded.
    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        label: &str,
        doc_id: &str,
        embedding: &[f32],
        text: &str,
        view: &FieldMap,
        requested: &[String],
        warnings: &mut Vec<PipelineWarning>,
    ) -> bool {
        let metadata = IndexMetadata {
            raw_text: text.to_string(),
            extracted_fields_json: serde_json::to_string(view).unwrap_or_else(|_| "{}".into()),
            label: label.to_string(),
            requested_fields_json: serde_json::to_string(requested)
                .unwrap_or_else(|_| "[]".into()),
        };

        match self.index.add(label, doc_id, embedding, metadata) {
            Ok(()) => {
                tracing::debug!(label = %label, doc_id = %doc_id, "Registered in similarity index");
                true
            }
            Err(e) => {
                tracing::warn!(label = %label, doc_id = %doc_id, error = %e, "Similarity index registration failed");
                warnings.push(PipelineWarning::RegistrationFailed(e.to_string()));
                false
            }
        }
    }

    /// Key under which `request` is cached right now.
    pub fn document_key(&self, request: &SampleRequest) -> DocumentKey {
        let (pdf_filename, root) = split_pdf_path(&request.pdf_path);
        let signature =
            compute_signature_with(&root, &pdf_filename, self.signature_mode, self.hybrid_bytes);
        make_key(&request.label, &pdf_filename, &signature)
    }
}

/// `(file name, parent directory)` of a PDF path.
pub fn split_pdf_path(path: &Path) -> (String, PathBuf) {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    (filename, root)
}

/// Similarity-index id: the file name, or `sample_{index}` when there is none.
fn doc_id(pdf_filename: &str, index: usize) -> String {
    if pdf_filename.is_empty() {
        format!("sample_{index}")
    } else {
        pdf_filename.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;
    use crate::pipeline::extraction::MockTextExtractor;
    use crate::pipeline::structuring::StructuringError;

    // ── Test doubles ───────────────────────────────────────

    #[derive(Default)]
    struct ExtractorState {
        /// Keys requested on each call.
        calls: Mutex<Vec<Vec<String>>>,
        /// Retrieval context received on each call.
        contexts: Mutex<Vec<Option<String>>>,
        answers: Mutex<HashMap<String, String>>,
        failing: AtomicBool,
        /// Cancelled from inside the extraction call, after it returns its answer.
        cancel_on_call: Mutex<Option<CancelToken>>,
    }

    impl ExtractorState {
        fn answer(&self, key: &str, value: &str) {
            self.answers.lock().unwrap().insert(key.into(), value.into());
        }
        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
        fn contexts(&self) -> Vec<Option<String>> {
            self.contexts.lock().unwrap().clone()
        }
    }

    struct RecordingExtractor(Arc<ExtractorState>);

    impl FieldExtractor for RecordingExtractor {
        fn extract_fields(
            &self,
            _label: &str,
            keys: &[String],
            _text: &str,
            rag_context: Option<&str>,
        ) -> Result<FieldMap, StructuringError> {
            self.0.calls.lock().unwrap().push(keys.to_vec());
            self.0.contexts.lock().unwrap().push(rag_context.map(str::to_string));
            if let Some(token) = self.0.cancel_on_call.lock().unwrap().as_ref() {
                token.cancel();
            }
            if self.0.failing.load(Ordering::SeqCst) {
                return Err(StructuringError::OllamaConnection("http://localhost:11434".into()));
            }
            let answers = self.0.answers.lock().unwrap();
            Ok(keys.iter().map(|k| (k.clone(), answers.get(k).cloned())).collect())
        }
    }

    /// In-memory index that counts successful adds.
    #[derive(Default)]
    struct IndexState {
        inner: InMemorySimilarityIndex,
        adds: AtomicUsize,
    }

    struct CountingIndex(Arc<IndexState>);

    impl SimilarityIndex for CountingIndex {
        fn add(&self, label: &str, id: &str, e: &[f32], m: IndexMetadata) -> Result<(), StorageError> {
            self.0.inner.add(label, id, e, m)?;
            self.0.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn query_nearest(
            &self,
            label: &str,
            e: &[f32],
            k: usize,
        ) -> Result<Vec<crate::pipeline::storage::Neighbor>, StorageError> {
            self.0.inner.query_nearest(label, e, k)
        }
        fn count(&self, label: &str) -> usize {
            self.0.inner.count(label)
        }
    }

    /// Hashing embedder that can be switched off.
    struct SwitchableEmbedder {
        inner: HashingEmbedder,
        down: Arc<AtomicBool>,
    }

    impl EmbeddingModel for SwitchableEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::Embedding("model offline".into()));
            }
            self.inner.embed(text)
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    struct Harness {
        pipeline: DocumentPipeline,
        extractor: Arc<ExtractorState>,
        index: Arc<IndexState>,
        embedder_down: Arc<AtomicBool>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_text_extractor(MockTextExtractor::new("Invoice Total: 100 Date: 2024-01-01"))
        }

        fn with_text_extractor(text_extractor: MockTextExtractor) -> Self {
            let extractor = Arc::new(ExtractorState::default());
            let index = Arc::new(IndexState::default());
            let embedder_down = Arc::new(AtomicBool::new(false));
            let pipeline = DocumentPipeline::new(
                Box::new(text_extractor),
                Box::new(SwitchableEmbedder {
                    inner: HashingEmbedder::new(),
                    down: embedder_down.clone(),
                }),
                Box::new(CountingIndex(index.clone())),
                Box::new(RecordingExtractor(extractor.clone())),
                16,
            );
            Self {
                pipeline,
                extractor,
                index,
                embedder_down,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn file(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn adds(&self) -> usize {
            self.index.adds.load(Ordering::SeqCst)
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn value(payload: &ResultPayload, key: &str) -> Option<String> {
        payload.requested_fields.get(key).cloned().flatten()
    }

    // ── Scenarios ──────────────────────────────────────────

    #[test]
    fn first_call_extracts_all_and_caches() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        h.extractor.answer("date", "2024-01-01");
        let pdf = h.file("a.pdf", "v1");

        let request = SampleRequest::new(0, "invoice", &pdf)
            .with_fields(&["total", "date"])
            .with_text("Total: 100, Date: 2024-01-01");
        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.cache, CacheOutcome::Miss);
        assert_eq!(outcome.payload.pdf_filename, "a.pdf");
        assert_eq!(value(&outcome.payload, "total"), Some("100".into()));
        assert_eq!(value(&outcome.payload, "date"), Some("2024-01-01".into()));
        assert!(outcome.registered_now);
        assert!(outcome.warnings.is_empty());
        assert_eq!(h.pipeline.cache().len(), 1);
        assert_eq!(h.adds(), 1);
        let mut called = h.extractor.calls().concat();
        called.sort();
        assert_eq!(called, keys(&["date", "total"]));
    }

    #[test]
    fn second_schema_extracts_only_new_field() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        h.extractor.answer("date", "2024-01-01");
        let pdf = h.file("a.pdf", "v1");
        let text = "Total: 100, Date: 2024-01-01";

        h.pipeline
            .process(
                &SampleRequest::new(0, "invoice", &pdf).with_fields(&["total", "date"]).with_text(text),
                &CancelToken::new(),
            )
            .unwrap();

        h.extractor.answer("vendor", "ACME");
        let outcome = h
            .pipeline
            .process(
                &SampleRequest::new(1, "invoice", &pdf).with_fields(&["total", "vendor"]).with_text(text),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(outcome.cache, CacheOutcome::HitPartial);
        assert_eq!(h.extractor.calls()[1], keys(&["vendor"]));
        assert_eq!(outcome.payload.requested_fields.len(), 2);
        assert_eq!(value(&outcome.payload, "total"), Some("100".into()));
        assert_eq!(value(&outcome.payload, "vendor"), Some("ACME".into()));
        assert!(!outcome.registered_now);
        assert_eq!(h.adds(), 1);
        assert_eq!(h.pipeline.cache().len(), 1);
    }

    #[test]
    fn partial_hit_merges_cached_and_new() {
        let h = Harness::new();
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["A", "B"]).with_text("A x B y");

        let key = h.pipeline.document_key(&request);
        let mut entry = CacheEntry::new("invoice", "a.pdf", crate::pipeline::cache::compute_signature(
            pdf.parent().unwrap(),
            "a.pdf",
            SignatureMode::Fast,
        ));
        entry.merge_fields([("A".to_string(), Some("x".to_string()))].into_iter().collect());
        h.pipeline.cache().put(key.clone(), entry);

        h.extractor.answer("B", "y");
        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(h.extractor.calls(), vec![keys(&["B"])]);
        assert_eq!(value(&outcome.payload, "A"), Some("x".into()));
        assert_eq!(value(&outcome.payload, "B"), Some("y".into()));
        let cached = h.pipeline.cache().get(&key).unwrap();
        assert_eq!(cached.fields().len(), 2);
    }

    #[test]
    fn full_hit_makes_no_extraction_call() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");

        h.pipeline.process(&request, &CancelToken::new()).unwrap();
        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.cache, CacheOutcome::HitAll);
        assert_eq!(h.extractor.calls().len(), 1);
        assert_eq!(value(&outcome.payload, "total"), Some("100".into()));
    }

    #[test]
    fn cached_null_counts_as_present() {
        let h = Harness::new();
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["po_number"]).with_text("x");

        let first = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(value(&first.payload, "po_number"), None);

        let second = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(second.cache, CacheOutcome::HitAll);
        assert_eq!(h.extractor.calls().len(), 1);
    }

    #[test]
    fn lazy_registration_happens_exactly_once() {
        let h = Harness::new();
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");

        // Cached before any index existed
        let key = h.pipeline.document_key(&request);
        let (_, root) = split_pdf_path(&pdf);
        let mut entry = CacheEntry::new(
            "invoice",
            "a.pdf",
            crate::pipeline::cache::compute_signature(&root, "a.pdf", SignatureMode::Fast),
        );
        entry.merge_fields([("total".to_string(), Some("100".to_string()))].into_iter().collect());
        h.pipeline.cache().put(key.clone(), entry);

        let first = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(first.cache, CacheOutcome::HitAll);
        assert!(first.registered_now);
        assert_eq!(h.adds(), 1);
        assert!(h.pipeline.cache().get(&key).unwrap().is_registered());

        let second = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert!(!second.registered_now);
        assert_eq!(h.adds(), 1);
        assert!(h.extractor.calls().is_empty());
    }

    #[test]
    fn replaced_file_is_extracted_from_scratch() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        let pdf = h.file("a.pdf", "short");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");
        let old_key = h.pipeline.document_key(&request);
        h.pipeline.process(&request, &CancelToken::new()).unwrap();

        // Size changes, so the fast signature changes
        h.file("a.pdf", "a much longer replacement body");
        h.extractor.answer("total", "200");
        let request = request.with_text("Total: 200");
        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.cache, CacheOutcome::Miss);
        assert_eq!(value(&outcome.payload, "total"), Some("200".into()));
        assert_eq!(h.extractor.calls().len(), 2);
        assert!(!h.pipeline.cache().contains(&old_key));
        assert_eq!(h.pipeline.cache().len(), 1);
        // New version registers again under the same id, replacing the old record
        assert_eq!(h.adds(), 2);
        assert_eq!(h.pipeline.index().count("invoice"), 1);
    }

    #[test]
    fn empty_schema_is_full_hit() {
        let h = Harness::new();
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_text("anything");

        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.cache, CacheOutcome::HitAll);
        assert!(outcome.payload.requested_fields.is_empty());
        assert!(h.extractor.calls().is_empty());
        assert_eq!(h.adds(), 0);
    }

    #[test]
    fn empty_label_is_a_normal_label() {
        let h = Harness::new();
        h.extractor.answer("total", "5");
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "", &pdf).with_fields(&["total"]).with_text("Total: 5");

        h.pipeline.process(&request, &CancelToken::new()).unwrap();
        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.cache, CacheOutcome::HitAll);
        assert_eq!(outcome.payload.label, "");
        assert_eq!(h.pipeline.index().count(""), 1);
    }

    #[test]
    fn cancelled_request_writes_nothing() {
        let h = Harness::new();
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = h.pipeline.process(&request, &cancel);

        assert!(matches!(result, Err(ProcessingError::Cancelled)));
        assert!(h.pipeline.cache().is_empty());
        assert!(h.extractor.calls().is_empty());
        assert_eq!(h.adds(), 0);
    }

    #[test]
    fn cancel_during_extraction_skips_registration_and_write_back() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        let cancel = CancelToken::new();
        *h.extractor.cancel_on_call.lock().unwrap() = Some(cancel.clone());
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");

        let result = h.pipeline.process(&request, &cancel);

        assert!(matches!(result, Err(ProcessingError::Cancelled)));
        assert_eq!(h.extractor.calls().len(), 1);
        assert_eq!(h.adds(), 0);
        assert!(h.pipeline.cache().is_empty());
    }

    #[test]
    fn cancel_during_extraction_without_embedding_writes_nothing() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        h.embedder_down.store(true, Ordering::SeqCst);
        let cancel = CancelToken::new();
        *h.extractor.cancel_on_call.lock().unwrap() = Some(cancel.clone());
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");

        let result = h.pipeline.process(&request, &cancel);

        // No embedding means no registration step; the write-back check stops it
        assert!(matches!(result, Err(ProcessingError::Cancelled)));
        assert_eq!(h.extractor.calls().len(), 1);
        assert_eq!(h.adds(), 0);
        assert!(h.pipeline.cache().is_empty());
    }

    #[test]
    fn cancel_during_partial_hit_leaves_cached_entry_unchanged() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        h.extractor.answer("vendor", "ACME");
        let pdf = h.file("a.pdf", "v1");
        let text = "Total: 100 Vendor: ACME";
        h.pipeline
            .process(
                &SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text(text),
                &CancelToken::new(),
            )
            .unwrap();

        let cancel = CancelToken::new();
        *h.extractor.cancel_on_call.lock().unwrap() = Some(cancel.clone());
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total", "vendor"]).with_text(text);
        let result = h.pipeline.process(&request, &cancel);

        assert!(matches!(result, Err(ProcessingError::Cancelled)));
        let key = h.pipeline.document_key(&request);
        let cached = h.pipeline.cache().get(&key).unwrap();
        assert_eq!(cached.fields().keys().cloned().collect::<Vec<_>>(), keys(&["total"]));
        assert_eq!(h.adds(), 1);
    }

    #[test]
    fn unreadable_text_is_never_registered() {
        let h = Harness::with_text_extractor(MockTextExtractor::failing());
        let pdf = h.file("a.pdf", "not a pdf");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]);

        let first = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(first.cache, CacheOutcome::Miss);
        assert!(!first.registered_now);
        assert!(matches!(first.warnings[..], [PipelineWarning::TextExtractionFailed(_)]));

        let second = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(second.cache, CacheOutcome::HitAll);
        assert!(!second.registered_now);
        assert_eq!(value(&second.payload, "total"), None);

        assert_eq!(h.adds(), 0);
        assert_eq!(h.pipeline.index().count("invoice"), 0);
        assert!(h.extractor.calls().is_empty());
        let key = h.pipeline.document_key(&request);
        assert!(!h.pipeline.cache().get(&key).unwrap().is_registered());
    }

    #[test]
    fn blank_supplied_text_is_never_registered() {
        let h = Harness::new();
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("  \n ");

        h.pipeline.process(&request, &CancelToken::new()).unwrap();
        let second = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(second.cache, CacheOutcome::HitAll);
        assert!(!second.registered_now);
        assert_eq!(h.adds(), 0);
    }

    #[test]
    fn llm_failure_keeps_cached_fields_and_retries_later() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        let pdf = h.file("a.pdf", "v1");
        let text = "Total: 100 Vendor: ACME";
        h.pipeline
            .process(
                &SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text(text),
                &CancelToken::new(),
            )
            .unwrap();

        h.extractor.failing.store(true, Ordering::SeqCst);
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total", "vendor"]).with_text(text);
        let failed = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(value(&failed.payload, "total"), Some("100".into()));
        assert_eq!(value(&failed.payload, "vendor"), None);
        assert!(matches!(failed.warnings[..], [PipelineWarning::ExtractionFailed(_)]));
        let key = h.pipeline.document_key(&request);
        assert!(!h.pipeline.cache().get(&key).unwrap().fields().contains_key("vendor"));

        h.extractor.failing.store(false, Ordering::SeqCst);
        h.extractor.answer("vendor", "ACME");
        let retried = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(h.extractor.calls().last().unwrap(), &keys(&["vendor"]));
        assert_eq!(value(&retried.payload, "vendor"), Some("ACME".into()));
    }

    #[test]
    fn llm_failure_on_new_document_does_not_register() {
        let h = Harness::new();
        h.extractor.failing.store(true, Ordering::SeqCst);
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 1");

        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(value(&outcome.payload, "total"), None);
        assert!(!outcome.registered_now);
        assert_eq!(h.adds(), 0);
    }

    #[test]
    fn embedding_failure_degrades_and_registers_on_next_full_hit() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        h.embedder_down.store(true, Ordering::SeqCst);
        let pdf = h.file("a.pdf", "v1");
        let request = SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]).with_text("Total: 100");

        let first = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(value(&first.payload, "total"), Some("100".into()));
        assert!(matches!(first.warnings[..], [PipelineWarning::EmbeddingFailed(_)]));
        assert!(!first.registered_now);
        assert_eq!(h.extractor.contexts(), vec![None]);

        h.embedder_down.store(false, Ordering::SeqCst);
        let second = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(second.cache, CacheOutcome::HitAll);
        assert!(second.registered_now);
        assert_eq!(h.adds(), 1);
    }

    #[test]
    fn similar_prior_document_primes_extraction() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        let a = h.file("a.pdf", "first");
        let b = h.file("b.pdf", "second");

        h.pipeline
            .process(
                &SampleRequest::new(0, "invoice", &a).with_fields(&["total"]).with_text("Invoice Total: 100 ACME"),
                &CancelToken::new(),
            )
            .unwrap();
        h.pipeline
            .process(
                &SampleRequest::new(1, "invoice", &b).with_fields(&["total"]).with_text("Invoice Total: 250 ACME"),
                &CancelToken::new(),
            )
            .unwrap();

        let contexts = h.extractor.contexts();
        assert_eq!(contexts[0], None);
        let context = contexts[1].as_deref().unwrap();
        assert!(context.contains("[LABEL]: invoice"));
        assert!(context.contains("[PAST_REQUESTED_FIELDS]: [\"total\"]"));
        assert!(context.contains("[PAST_EXTRACTION_JSON]:\n{\"total\":\"100\"}"));
    }

    #[test]
    fn other_labels_never_prime_extraction() {
        let h = Harness::new();
        let a = h.file("a.pdf", "first");
        let b = h.file("b.pdf", "second");

        h.pipeline
            .process(
                &SampleRequest::new(0, "invoice", &a).with_fields(&["total"]).with_text("Total: 100"),
                &CancelToken::new(),
            )
            .unwrap();
        h.pipeline
            .process(
                &SampleRequest::new(1, "receipt", &b).with_fields(&["total"]).with_text("Total: 100"),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(h.extractor.contexts(), vec![None, None]);
    }

    #[test]
    fn text_is_read_from_file_when_not_supplied() {
        let h = Harness::with_text_extractor(MockTextExtractor::new("Invoice Total: 42"));
        h.extractor.answer("total", "42");
        let pdf = h.file("a.pdf", "v1");

        let outcome = h
            .pipeline
            .process(&SampleRequest::new(0, "invoice", &pdf).with_fields(&["total"]), &CancelToken::new())
            .unwrap();

        assert_eq!(value(&outcome.payload, "total"), Some("42".into()));
    }

    #[test]
    fn missing_file_degrades_to_nulls_and_is_not_cached() {
        let h = Harness::with_text_extractor(MockTextExtractor::failing());
        let pdf = h.dir.path().join("absent.pdf");
        let request = SampleRequest::new(3, "invoice", &pdf).with_fields(&["total", "date"]);

        let outcome = h.pipeline.process(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.payload.pdf_filename, "absent.pdf");
        assert_eq!(outcome.payload.requested_fields.len(), 2);
        assert!(outcome.payload.requested_fields.values().all(Option::is_none));
        assert!(matches!(outcome.warnings[..], [PipelineWarning::TextExtractionFailed(_)]));
        assert!(h.extractor.calls().is_empty());
        assert!(h.pipeline.cache().is_empty());

        let again = h.pipeline.process(&request, &CancelToken::new()).unwrap();
        assert_eq!(again.cache, CacheOutcome::Miss);
    }

    #[test]
    fn process_single_sample_returns_payload() {
        let h = Harness::new();
        h.extractor.answer("total", "100");
        let pdf = h.file("a.pdf", "v1");
        let schema: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"total": "Invoice total amount"}"#).unwrap();

        let payload = h
            .pipeline
            .process_single_sample(0, "invoice", &schema, &pdf, Some("Total: 100"));

        assert_eq!(payload.label, "invoice");
        assert_eq!(payload.pdf_filename, "a.pdf");
        assert_eq!(value(&payload, "total"), Some("100".into()));
    }

    #[test]
    fn payload_serializes_nulls() {
        let payload = ResultPayload {
            label: "invoice".into(),
            pdf_filename: "a.pdf".into(),
            requested_fields: [("total".to_string(), None)].into_iter().collect(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["requested_fields"]["total"], serde_json::Value::Null);
    }

    #[test]
    fn split_path_handles_bare_names() {
        assert_eq!(
            split_pdf_path(Path::new("/data/pdfs/a.pdf")),
            ("a.pdf".to_string(), PathBuf::from("/data/pdfs"))
        );
        assert_eq!(split_pdf_path(Path::new("a.pdf")), ("a.pdf".to_string(), PathBuf::new()));
        assert_eq!(doc_id("", 7), "sample_7");
        assert_eq!(doc_id("a.pdf", 7), "a.pdf");
    }

    #[test]
    fn concurrent_documents_do_not_interfere() {
        let h = Arc::new(Harness::new());
        h.extractor.answer("total", "100");
        let paths: Vec<PathBuf> = (0..8).map(|i| h.file(&format!("doc{i}.pdf"), "v1")).collect();

        let handles: Vec<_> = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let h = h.clone();
                std::thread::spawn(move || {
                    let request = SampleRequest::new(i, "invoice", path)
                        .with_fields(&["total"])
                        .with_text(&format!("Invoice {i} Total: 100"));
                    h.pipeline.process(&request, &CancelToken::new()).unwrap()
                })
            })
            .collect();

        for handle in handles {
            let outcome = handle.join().unwrap();
            assert_eq!(value(&outcome.payload, "total"), Some("100".into()));
        }
        assert_eq!(h.pipeline.cache().len(), 8);
        assert_eq!(h.pipeline.index().count("invoice"), 8);
    }
}
