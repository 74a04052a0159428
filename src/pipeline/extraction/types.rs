use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// Separator placed between the text of consecutive pages.
pub const PAGE_BREAK: &str = "\n\n--- PAGE BREAK ---\n\n";

/// Raw text of a document plus the words of its first page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PdfText {
    pub text: String,
    pub page_words: Vec<PageWord>,
}

/// A word with its bounding box relative to the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageWord {
    pub text: String,
    pub bbox: NormalizedBox,
}

/// Bounding box with coordinates in `[0, 1]` of the page size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// Text extraction abstraction (allows mocking for tests).
pub trait TextExtractor {
    fn extract_text(&self, path: &Path) -> Result<PdfText, ExtractionError>;
}

/// Join per-page text: pages trimmed, empty pages dropped.
pub fn join_pages<I, S>(pages: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    pages
        .into_iter()
        .filter_map(|p| {
            let trimmed = p.as_ref().trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join(PAGE_BREAK)
}
