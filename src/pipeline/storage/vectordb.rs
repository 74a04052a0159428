use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{cosine_distance, IndexMetadata, Neighbor, SimilarityIndex};
use super::StorageError;

#[derive(Debug, Clone)]
struct StoredVector {
    id: String,
    embedding: Vec<f32>,
    metadata: IndexMetadata,
}

/// Similarity index held entirely in memory. Lost on restart.
pub struct InMemorySimilarityIndex {
    namespaces: Mutex<HashMap<String, Vec<StoredVector>>>,
}

impl InMemorySimilarityIndex {
    pub fn new() -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<StoredVector>>> {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total records across all namespaces.
    pub fn total_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Reject embeddings that cannot be stored in `label`'s namespace.
    fn validate(&self, label: &str, embedding: &[f32]) -> Result<(), StorageError> {
        if embedding.is_empty() {
            return Err(StorageError::VectorDb("Empty embedding".into()));
        }
        let namespaces = self.lock();
        if let Some(first) = namespaces.get(label).and_then(|records| records.first()) {
            if first.embedding.len() != embedding.len() {
                return Err(StorageError::DimensionMismatch {
                    expected: first.embedding.len(),
                    actual: embedding.len(),
                });
            }
        }
        Ok(())
    }

    fn records(&self, label: &str) -> Vec<StoredVector> {
        self.lock().get(label).cloned().unwrap_or_default()
    }

    /// Insert without validation. Replaces a record with the same id.
    fn insert(&self, label: &str, record: StoredVector) {
        let mut namespaces = self.lock();
        let records = namespaces.entry(label.to_string()).or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }
}

impl Default for InMemorySimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SimilarityIndex for InMemorySimilarityIndex {
    fn add(
        &self,
        label: &str,
        id: &str,
        embedding: &[f32],
        metadata: IndexMetadata,
    ) -> Result<(), StorageError> {
        self.validate(label, embedding)?;
        self.insert(
            label,
            StoredVector {
                id: id.to_string(),
                embedding: embedding.to_vec(),
                metadata,
            },
        );
        Ok(())
    }

    fn query_nearest(
        &self,
        label: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, StorageError> {
        let namespaces = self.lock();
        let Some(records) = namespaces.get(label) else {
            return Ok(vec![]);
        };

        let mut hits = Vec::with_capacity(records.len());
        for record in records {
            if record.embedding.len() != embedding.len() {
                return Err(StorageError::DimensionMismatch {
                    expected: record.embedding.len(),
                    actual: embedding.len(),
                });
            }
            hits.push(Neighbor {
                id: record.id.clone(),
                distance: cosine_distance(&record.embedding, embedding),
                metadata: record.metadata.clone(),
            });
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    fn count(&self, label: &str) -> usize {
        self.lock().get(label).map_or(0, Vec::len)
    }
}

// ═══════════════════════════════════════════════════════════
// File-backed index
// ═══════════════════════════════════════════════════════════

/// One line of a namespace file.
#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    label: String,
    id: String,
    embedding: Vec<f32>,
    metadata: IndexMetadata,
}

/// Similarity index persisted as one append-only JSON-lines file per label.
///
/// Files are replayed into memory on open; for a repeated id the later line
/// wins. Unreadable lines are skipped with a warning. A file that replayed
/// more lines than it holds records is rewritten with one line per record.
pub struct FileSimilarityIndex {
    dir: PathBuf,
    memory: InMemorySimilarityIndex,
    append_lock: Mutex<()>,
}

impl FileSimilarityIndex {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let memory = InMemorySimilarityIndex::new();

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                paths.push(path);
            }
        }

        let files = paths.len();
        for path in &paths {
            let replay = replay_file(path, &memory)?;
            if let Some(label) = replay.label {
                let records = memory.records(&label);
                if records.len() < replay.lines {
                    compact_file(path, &label, &records)?;
                    tracing::info!(
                        file = %path.display(),
                        lines = replay.lines,
                        records = records.len(),
                        "Compacted index namespace file"
                    );
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            namespaces = files,
            records = memory.total_count(),
            "Opened similarity index"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            memory,
            append_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn namespace_path(&self, label: &str) -> PathBuf {
        self.dir.join(namespace_file_name(label))
    }
}

/// File name for a label's namespace: filesystem-safe regardless of the label.
pub fn namespace_file_name(label: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(label.as_bytes()));
    format!("label__{}.jsonl", &digest[..16])
}

/// What replaying one namespace file saw.
struct Replay {
    /// Label of the last record loaded; `None` when nothing loaded.
    label: Option<String>,
    /// Non-blank lines read, loaded or not.
    lines: usize,
}

fn replay_file(path: &Path, memory: &InMemorySimilarityIndex) -> Result<Replay, StorageError> {
    let reader = BufReader::new(File::open(path)?);
    let mut replay = Replay { label: None, lines: 0 };
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        replay.lines += 1;
        match serde_json::from_str::<PersistedRecord>(&line) {
            Ok(rec) if memory.validate(&rec.label, &rec.embedding).is_ok() => {
                replay.label = Some(rec.label.clone());
                memory.insert(
                    &rec.label,
                    StoredVector {
                        id: rec.id,
                        embedding: rec.embedding,
                        metadata: rec.metadata,
                    },
                );
            }
            Ok(rec) => {
                tracing::warn!(
                    file = %path.display(),
                    line = line_no + 1,
                    id = %rec.id,
                    "Skipping index record with incompatible embedding"
                );
            }
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable index record"
                );
            }
        }
    }
    Ok(replay)
}

/// Rewrite `path` with one line per record, through a temp file and rename.
fn compact_file(path: &Path, label: &str, records: &[StoredVector]) -> Result<(), StorageError> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for record in records {
            let line = serde_json::to_string(&PersistedRecord {
                label: label.to_string(),
                id: record.id.clone(),
                embedding: record.embedding.clone(),
                metadata: record.metadata.clone(),
            })?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl SimilarityIndex for FileSimilarityIndex {
    fn add(
        &self,
        label: &str,
        id: &str,
        embedding: &[f32],
        metadata: IndexMetadata,
    ) -> Result<(), StorageError> {
        self.memory.validate(label, embedding)?;

        let record = PersistedRecord {
            label: label.to_string(),
            id: id.to_string(),
            embedding: embedding.to_vec(),
            metadata,
        };
        let line = serde_json::to_string(&record)?;

        {
            let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.namespace_path(label))?;
            writeln!(file, "{line}")?;
        }

        self.memory.insert(
            label,
            StoredVector {
                id: record.id,
                embedding: record.embedding,
                metadata: record.metadata,
            },
        );
        Ok(())
    }

    fn query_nearest(
        &self,
        label: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>, StorageError> {
        self.memory.query_nearest(label, embedding, k)
    }

    fn count(&self, label: &str) -> usize {
        self.memory.count(label)
    }
}
