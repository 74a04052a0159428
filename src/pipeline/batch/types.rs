use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::cache::FieldMap;
use crate::pipeline::processor::PipelineWarning;

/// One dataset entry as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub extraction_schema: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_filename: Option<String>,
    /// Pre-extracted text; the file is still required to exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_content: Option<String>,
}

/// The dataset item with its schema values replaced by extracted values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledItem {
    pub label: String,
    pub extraction_schema: FieldMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ok,
    Error,
}

/// Per-item bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub index: usize,
    pub file_name: String,
    pub status: ItemStatus,
    pub response_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PipelineWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub failed: usize,
    pub avg_response_ms: u64,
}

/// Everything a finished batch produced, items in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<FilledItem>,
    pub meta: Vec<ItemMeta>,
    pub summary: BatchSummary,
}

/// Progress events, emitted as items finish (not necessarily in input order).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Start {
        job_id: Uuid,
        total: usize,
    },
    ItemOk {
        job_id: Uuid,
        index: usize,
        file_name: String,
        response_ms: u64,
        filled_item: FilledItem,
        processed: usize,
        total: usize,
    },
    ItemError {
        job_id: Uuid,
        index: usize,
        file_name: String,
        response_ms: u64,
        error: String,
        processed: usize,
        total: usize,
    },
    Complete {
        job_id: Uuid,
        processed: usize,
        failed: usize,
        total: usize,
    },
}
