//! Batch-specific error types.
//!
//! `BatchError` covers the dataset as a whole; `ItemError` is recorded per
//! item and never stops the batch.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid dataset JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid PDF root folder: {0}")]
    InvalidRoot(PathBuf),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ItemError {
    #[error("Item missing 'pdf_path' or 'pdf_filename'")]
    MissingPathReference,

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Worker failed: {0}")]
    Worker(String),
}
