//! Bounded LRU store of per-document field mappings.
//!
//! Key properties:
//! - At most one live entry per (label, filename): observing a new key for a
//!   pair removes the entry stored under its previous key
//! - Strict LRU eviction at a fixed capacity (`get` and `put` both refresh recency)
//! - An evicted entry also drops its (label, filename) → key mapping, so the
//!   mapping only outgrows the entries by pairs that were observed but never
//!   stored (missing files, cancelled requests)
//! - Every public operation takes the single internal mutex, so lookups never
//!   observe a half-applied eviction
//! - Nothing here returns an error; absence always means "extract from scratch"

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::Serialize;

use super::signature::DocumentKey;
use super::types::CacheEntry;

/// Default number of documents kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 2000;

/// Size snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    /// (label, filename) pairs with a recorded latest key.
    pub tracked_files: usize,
}

struct CacheInner {
    entries: LruCache<DocumentKey, CacheEntry>,
    /// (label, filename) → most recently observed key.
    latest: HashMap<(String, String), DocumentKey>,
}

// ═══════════════════════════════════════════════════════════
// DocumentCache
// ═══════════════════════════════════════════════════════════

/// Thread-safe document cache shared by every request of one pipeline.
pub struct DocumentCache {
    inner: Mutex<CacheInner>,
}

impl DocumentCache {
    /// Create a cache holding at most `capacity` entries (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                latest: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // A panic elsewhere must not turn the cache into a hard failure.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Invalidation ─────────────────────────────────────

    /// Record `new_key` as the current key for (label, filename).
    ///
    /// If a different key was recorded before and still has an entry, that
    /// entry is removed (the file changed on disk). Returns true when an
    /// entry was invalidated.
    pub fn upsert_latest_key(&self, label: &str, pdf_filename: &str, new_key: &DocumentKey) -> bool {
        let mut inner = self.lock();
        let pair = (label.to_string(), pdf_filename.to_string());

        let mut invalidated = false;
        if let Some(old_key) = inner.latest.get(&pair).cloned() {
            if &old_key != new_key && inner.entries.pop(&old_key).is_some() {
                tracing::debug!(
                    label = %label,
                    pdf = %pdf_filename,
                    old_key = %old_key,
                    "Document changed on disk, dropped stale cache entry"
                );
                invalidated = true;
            }
        }

        inner.latest.insert(pair, new_key.clone());
        invalidated
    }

    // ── Entry operations ─────────────────────────────────

    /// Fetch a copy of the entry and mark it most recently used.
    pub fn get(&self, key: &DocumentKey) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Whether an entry exists, without touching recency.
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Insert or replace an entry, mark it most recently used, and evict the
    /// least recently used entries beyond capacity.
    pub fn put(&self, key: DocumentKey, entry: CacheEntry) {
        let mut inner = self.lock();
        if let Some((evicted_key, evicted)) = inner.entries.push(key.clone(), entry) {
            if evicted_key != key {
                let pair = (evicted.label, evicted.pdf_filename);
                if inner.latest.get(&pair) == Some(&evicted_key) {
                    inner.latest.remove(&pair);
                }
                tracing::debug!(
                    key = %evicted_key,
                    pdf = %pair.1,
                    "Evicted least recently used cache entry"
                );
            }
        }
    }

    // ── Introspection ────────────────────────────────────

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            size: inner.entries.len(),
            capacity: inner.entries.cap().get(),
            tracked_files: inner.latest.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
