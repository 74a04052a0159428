//! Retrieval context: the most similar prior document of the same label,
//! formatted as a hint for field extraction.

pub mod types;
pub mod context;

pub use types::*;
pub use context::*;
