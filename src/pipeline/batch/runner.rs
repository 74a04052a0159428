//! Batch runner: drives a dataset through a shared `DocumentPipeline`.
//!
//! Items run on the blocking pool, at most `workers` at a time. Failures are
//! recorded per item; the batch itself always completes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::dataset::{empty_filled_item, file_name_for, materialize_filled_item, resolve_pdf_path};
use super::error::ItemError;
use super::types::{BatchEvent, BatchReport, BatchSummary, DatasetItem, FilledItem, ItemMeta, ItemStatus};
use crate::pipeline::processor::{CancelToken, DocumentPipeline, ProcessingError, SampleRequest};

pub const DEFAULT_WORKERS: usize = 4;

/// Result of one item, before it is slotted back into input order.
#[derive(Debug)]
struct ItemOutcome {
    filled: FilledItem,
    meta: ItemMeta,
}

impl ItemOutcome {
    fn failed(index: usize, item: &DatasetItem, file_name: String, response_ms: u64, error: ItemError) -> Self {
        Self {
            filled: empty_filled_item(item),
            meta: ItemMeta {
                index,
                file_name,
                status: ItemStatus::Error,
                response_ms,
                error: Some(error.to_string()),
                warnings: Vec::new(),
            },
        }
    }

    fn event(&self, job_id: Uuid, processed: usize, total: usize) -> BatchEvent {
        match (&self.meta.status, &self.meta.error) {
            (ItemStatus::Error, error) => BatchEvent::ItemError {
                job_id,
                index: self.meta.index,
                file_name: self.meta.file_name.clone(),
                response_ms: self.meta.response_ms,
                error: error.clone().unwrap_or_default(),
                processed,
                total,
            },
            (ItemStatus::Ok, _) => BatchEvent::ItemOk {
                job_id,
                index: self.meta.index,
                file_name: self.meta.file_name.clone(),
                response_ms: self.meta.response_ms,
                filled_item: self.filled.clone(),
                processed,
                total,
            },
        }
    }
}

pub struct BatchRunner {
    pipeline: Arc<DocumentPipeline>,
    workers: usize,
    cancel: CancelToken,
}

impl BatchRunner {
    /// `workers` is clamped to at least 1.
    pub fn new(pipeline: Arc<DocumentPipeline>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
            cancel: CancelToken::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Cancelling makes every item not yet finished fail with "Processing cancelled".
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Process `items`, resolving relative references against `root`.
    ///
    /// Events are best-effort: a dropped receiver does not stop the batch.
    pub async fn run(
        &self,
        items: Vec<DatasetItem>,
        root: &Path,
        events: mpsc::UnboundedSender<BatchEvent>,
    ) -> BatchReport {
        let job_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = items.len();

        tracing::info!(%job_id, total, workers = self.workers, root = %root.display(), "Batch started");
        let _ = events.send(BatchEvent::Start { job_id, total });

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let inputs = items.clone();

        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            let root = root.to_path_buf();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let fallback = item.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    process_item(&pipeline, index, &item, &root, &cancel)
                });
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(index, error = %e, "Batch worker panicked");
                        let name = file_name_for(&fallback, index);
                        ItemOutcome::failed(index, &fallback, name, 0, ItemError::Worker(e.to_string()))
                    }
                }
            });
        }

        let mut slots: Vec<Option<ItemOutcome>> = (0..total).map(|_| None).collect();
        let mut processed = 0;
        let mut failed = 0;

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "Batch task failed");
                    continue;
                }
            };
            processed += 1;
            if outcome.meta.status == ItemStatus::Error {
                failed += 1;
            }
            let _ = events.send(outcome.event(job_id, processed, total));
            let index = outcome.meta.index;
            slots[index] = Some(outcome);
        }

        for index in fill_lost_slots(&mut slots, &inputs) {
            processed += 1;
            failed += 1;
            if let Some(outcome) = &slots[index] {
                let _ = events.send(outcome.event(job_id, processed, total));
            }
        }

        let (items, meta): (Vec<FilledItem>, Vec<ItemMeta>) = slots
            .into_iter()
            .flatten()
            .map(|o| (o.filled, o.meta))
            .unzip();

        let summary = summarize(&meta);
        let finished_at = Utc::now();

        tracing::info!(
            %job_id,
            processed,
            failed = summary.failed,
            avg_response_ms = summary.avg_response_ms,
            "Batch complete"
        );
        let _ = events.send(BatchEvent::Complete {
            job_id,
            processed,
            failed,
            total,
        });

        BatchReport {
            job_id,
            started_at,
            finished_at,
            items,
            meta,
            summary,
        }
    }
}

/// Fail every slot whose task never reported, so the report keeps one
/// entry per input item. Returns the filled indices.
fn fill_lost_slots(slots: &mut [Option<ItemOutcome>], items: &[DatasetItem]) -> Vec<usize> {
    let mut filled = Vec::new();
    for (index, (slot, item)) in slots.iter_mut().zip(items).enumerate() {
        if slot.is_none() {
            tracing::error!(index, "Batch item lost its worker task");
            let name = file_name_for(item, index);
            let error = ItemError::Worker("task did not complete".into());
            *slot = Some(ItemOutcome::failed(index, item, name, 0, error));
            filled.push(index);
        }
    }
    filled
}

fn summarize(meta: &[ItemMeta]) -> BatchSummary {
    let total = meta.len();
    let failed = meta.iter().filter(|m| m.status == ItemStatus::Error).count();
    let avg_response_ms = if total == 0 {
        0
    } else {
        meta.iter().map(|m| m.response_ms).sum::<u64>() / total as u64
    };
    BatchSummary {
        total,
        failed,
        avg_response_ms,
    }
}

fn process_item(
    pipeline: &DocumentPipeline,
    index: usize,
    item: &DatasetItem,
    root: &Path,
    cancel: &CancelToken,
) -> ItemOutcome {
    let started = Instant::now();
    let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;
    let file_name = file_name_for(item, index);

    let path: PathBuf = match resolve_pdf_path(item, root) {
        Ok((path, _)) => path,
        Err(e) => {
            tracing::warn!(index, error = %e, "Batch item rejected");
            return ItemOutcome::failed(index, item, file_name, elapsed_ms(started), e);
        }
    };

    if !path.is_file() {
        tracing::warn!(index, path = %path.display(), "Batch item file not found");
        return ItemOutcome::failed(
            index,
            item,
            file_name,
            elapsed_ms(started),
            ItemError::FileNotFound(path),
        );
    }

    let request = SampleRequest {
        index,
        label: item.label.clone(),
        extraction_schema: item.extraction_schema.clone(),
        pdf_path: path,
        text: item.pdf_content.clone(),
    };

    match pipeline.process(&request, cancel) {
        Ok(outcome) => {
            let response_ms = elapsed_ms(started);
            tracing::debug!(
                index,
                file = %file_name,
                cache = outcome.cache.as_str(),
                response_ms,
                "Batch item processed"
            );
            ItemOutcome {
                filled: materialize_filled_item(item, &outcome.payload),
                meta: ItemMeta {
                    index,
                    file_name,
                    status: ItemStatus::Ok,
                    response_ms,
                    error: None,
                    warnings: outcome.warnings,
                },
            }
        }
        Err(ProcessingError::Cancelled) => {
            ItemOutcome::failed(index, item, file_name, elapsed_ms(started), ItemError::Cancelled)
        }
    }
}
