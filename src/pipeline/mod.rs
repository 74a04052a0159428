pub mod cache;
pub mod extraction;
pub mod structuring;
pub mod storage;
pub mod rag;
pub mod processor; // Document Processing Orchestrator
pub mod batch;
