use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::types::{join_pages, PdfText, TextExtractor};
use super::ExtractionError;

/// PDF text extractor using the pdf-extract crate.
/// Handles digital PDFs with embedded text layers.
///
/// pdf-extract does not report glyph positions, so `page_words` is always empty.
pub struct PdfTextExtractor;

impl PdfTextExtractor {
    /// Extract page texts from in-memory PDF bytes.
    pub fn extract_pages(pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
        // pdf-extract panics on some malformed inputs.
        std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(pdf_bytes))
            .map_err(|_| ExtractionError::PdfParsing("parser panicked".into()))?
            .map_err(|e| ExtractionError::PdfParsing(e.to_string()))
    }
}

impl TextExtractor for PdfTextExtractor {
    fn extract_text(&self, path: &Path) -> Result<PdfText, ExtractionError> {
        let bytes = std::fs::read(path)?;
        let pages = Self::extract_pages(&bytes)?;

        tracing::debug!(path = %path.display(), pages = pages.len(), "Extracted PDF text");

        Ok(PdfText {
            text: join_pages(pages),
            page_words: vec![],
        })
    }
}

/// Mock extractor for testing: returns configured text and counts calls.
pub struct MockTextExtractor {
    text: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl MockTextExtractor {
    pub fn new(text: &str) -> Self {
        Self {
            text: Mutex::new(Some(text.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    /// An extractor that always fails.
    pub fn failing() -> Self {
        Self {
            text: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Change the text returned by later calls.
    pub fn set_text(&self, text: &str) {
        if let Ok(mut guard) = self.text.lock() {
            *guard = Some(text.to_string());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextExtractor for MockTextExtractor {
    fn extract_text(&self, path: &Path) -> Result<PdfText, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .text
            .lock()
            .map_err(|_| ExtractionError::PdfParsing("mock lock poisoned".into()))?
            .clone();
        match text {
            Some(text) => Ok(PdfText {
                text,
                page_words: vec![],
            }),
            None => Err(ExtractionError::PdfParsing(format!(
                "mock failure for {}",
                path.display()
            ))),
        }
    }
}
