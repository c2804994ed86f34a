use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::fingerprint::ContentFingerprint;
use crate::models::ExtractedInvoice;

const INDEX_FILE: &str = "cache_index.json";

/// Configuration for the on-disk extraction cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Entry ceiling; exceeding it evicts the oldest-accessed tenth.
    pub max_entries: usize,
    /// Entries older than this are treated as absent and removed.
    pub retention_days: i64,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_entries: 1000,
            retention_days: 30,
        }
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }
}

/// Persisted projection of an [`ExtractedInvoice`] keyed by fingerprint.
///
/// Never mutated in place: an entry is only created, expired, or evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    cached_at: DateTime<Utc>,
    invoice: ExtractedInvoice,
}

/// On-disk cache mapping content fingerprints to extraction results.
///
/// One JSON file per fingerprint, plus an access-time index maintained
/// alongside the entries (not embedded in them) for approximate-LRU
/// eviction. Error-confidence records are never stored, so the cache
/// cannot serve a result known to have failed extraction.
pub struct ContentCache {
    dir: PathBuf,
    max_entries: usize,
    retention: Duration,
    /// Fingerprint hex -> last access, epoch microseconds.
    index: HashMap<String, i64>,
}

impl ContentCache {
    pub fn new(config: CacheConfig) -> Result<Self, ExtractError> {
        std::fs::create_dir_all(&config.dir)?;
        let index = load_index(&config.dir.join(INDEX_FILE));
        Ok(Self {
            dir: config.dir,
            max_entries: config.max_entries,
            retention: Duration::days(config.retention_days),
            index,
        })
    }

    /// Look up a previous extraction result for this fingerprint.
    ///
    /// Expired and malformed entries are removed and reported as absent,
    /// forcing re-extraction.
    pub fn lookup(&mut self, fingerprint: &ContentFingerprint) -> Option<ExtractedInvoice> {
        let path = self.entry_path(fingerprint);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                // Entry file gone; drop any stale index record for it.
                if self.index.remove(fingerprint.as_str()).is_some() {
                    self.persist_index();
                }
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "removing corrupted cache entry"
                );
                self.remove_entry(fingerprint);
                return None;
            }
        };

        if Utc::now() - entry.cached_at > self.retention {
            tracing::debug!(fingerprint = %fingerprint, "cache entry expired");
            self.remove_entry(fingerprint);
            return None;
        }

        self.touch(fingerprint);
        Some(entry.invoice)
    }

    /// Store an extraction result under this fingerprint.
    ///
    /// No-op for Error confidence.
    pub fn store(
        &mut self,
        fingerprint: &ContentFingerprint,
        invoice: &ExtractedInvoice,
    ) -> Result<(), ExtractError> {
        if invoice.is_error() {
            return Ok(());
        }

        let entry = CacheEntry {
            cached_at: Utc::now(),
            invoice: invoice.clone(),
        };
        let json = serde_json::to_string_pretty(&entry)?;
        std::fs::write(self.entry_path(fingerprint), json)?;

        self.touch(fingerprint);
        self.evict_if_over_ceiling();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn entry_path(&self, fingerprint: &ContentFingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.as_str()))
    }

    fn touch(&mut self, fingerprint: &ContentFingerprint) {
        self.index.insert(
            fingerprint.as_str().to_string(),
            Utc::now().timestamp_micros(),
        );
        self.persist_index();
    }

    fn remove_entry(&mut self, fingerprint: &ContentFingerprint) {
        let _ = std::fs::remove_file(self.entry_path(fingerprint));
        self.index.remove(fingerprint.as_str());
        self.persist_index();
    }

    /// Evict the oldest-accessed tenth (at least one entry) once the
    /// ceiling is exceeded. The most recently accessed entries survive.
    fn evict_if_over_ceiling(&mut self) {
        if self.index.len() <= self.max_entries {
            return;
        }

        let mut by_access: Vec<(String, i64)> = self
            .index
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        by_access.sort_by_key(|(_, accessed)| *accessed);

        let evict_count = std::cmp::max(1, self.index.len() / 10);
        for (hex, _) in by_access.into_iter().take(evict_count) {
            let _ = std::fs::remove_file(self.dir.join(format!("{hex}.json")));
            self.index.remove(&hex);
        }
        tracing::debug!(evicted = evict_count, remaining = self.index.len(), "cache evicted");
        self.persist_index();
    }

    fn persist_index(&self) {
        match serde_json::to_string(&self.index) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.dir.join(INDEX_FILE), json) {
                    tracing::warn!(error = %e, "failed to persist cache index");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize cache index"),
        }
    }
}

/// A malformed index is dropped and rebuilt empty rather than failing
/// construction; entries then age back in on access.
fn load_index(path: &Path) -> HashMap<String, i64> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(error = %e, "removing corrupted cache index");
            let _ = std::fs::remove_file(path);
            HashMap::new()
        }
    }
}
