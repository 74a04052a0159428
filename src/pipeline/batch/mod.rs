//! Batch processing of labelled PDF datasets.
//!
//! A dataset is a JSON array of items, each naming a label, an extraction
//! schema and a PDF reference. The runner pushes every item through one
//! shared `DocumentPipeline` and reports per-item status plus progress events.

pub mod error;
pub mod types;
pub mod dataset;
pub mod runner;

pub use error::{BatchError, ItemError};
pub use types::*;
pub use dataset::*;
pub use runner::{BatchRunner, DEFAULT_WORKERS};
