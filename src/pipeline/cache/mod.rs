//! Document identity and the field-level cache.
//!
//! `signature` derives a stable identity for "this exact file content, for
//! this label"; `store` keeps the fields already extracted for each identity.

pub mod signature;
pub mod types;
pub mod store;

pub use signature::*;
pub use types::*;
pub use store::*;
