//! Storage Engine
//!
//! Deduplicating, append-only, per-bucket disk storage.
//!
//! # Disk Layout
//!
//! ```text
//! <root>/
//!   ├── 0.index     hash → (offset, length), rewritten on every flush
//!   ├── 0.data      raw payloads, append-only
//!   ├── 1.index
//!   ├── 1.data
//!   └── ...
//! ```
//!
//! # Batch Processing
//!
//! ```text
//!  lock(bucket) ─▶ load index ─▶ write phase ─▶ persist index ─▶ read phase ─▶ unlock ─▶ respond
//!                                 (dedup,         (only if new     (sorted by
//!                                  one append)     data staged)     offset)
//! ```
//!
//! Indexes are not cached between batches: each batch reads the index from
//! disk, mutates it, and writes it back.

mod engine;
mod index;
mod layout;
mod segment;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use engine::{BatchSummary, ResponseHandler, StorageEngine};
pub use index::{BucketIndex, DataEntry, INDEX_FORMAT_VERSION, INDEX_MAGIC, MAX_HASH_LEN};
pub use layout::{BucketLayout, DATA_EXTENSION, INDEX_EXTENSION};

/// Default storage root
pub const DEFAULT_STORAGE_ROOT: &str = "./archive-data";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Storage Engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding every bucket's index and data files
    pub root: PathBuf,

    /// fsync data and index files before acknowledging writes
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            sync_writes: true,
        }
    }
}

impl StorageConfig {
    /// Create a configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::Config("storage root must not be empty".into()));
        }
        if self.root.is_file() {
            return Err(Error::Config(format!(
                "storage root {} is a file",
                self.root.display()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the Storage Engine.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Batches processed
    pub batches: AtomicU64,

    /// Puts that wrote new data
    pub puts_stored: AtomicU64,

    /// Puts answered from the index without I/O
    pub puts_deduplicated: AtomicU64,

    /// Gets that returned data
    pub gets_found: AtomicU64,

    /// Gets for unknown hashes
    pub gets_missing: AtomicU64,

    /// Tasks answered with a storage fault
    pub tasks_failed: AtomicU64,

    /// Storage faults raised
    pub faults: AtomicU64,

    /// Payload bytes appended
    pub bytes_written: AtomicU64,

    /// Payload bytes read
    pub bytes_read: AtomicU64,
}

impl StorageStats {
    /// Record a finished batch.
    pub fn record_batch(&self, summary: &BatchSummary) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.puts_stored
            .fetch_add(summary.puts_stored as u64, Ordering::Relaxed);
        self.puts_deduplicated
            .fetch_add(summary.puts_deduplicated as u64, Ordering::Relaxed);
        self.gets_found
            .fetch_add(summary.gets_found as u64, Ordering::Relaxed);
        self.gets_missing
            .fetch_add(summary.gets_missing as u64, Ordering::Relaxed);
        self.tasks_failed
            .fetch_add(summary.failed as u64, Ordering::Relaxed);
    }

    /// Record a storage fault.
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record appended bytes.
    pub fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record read bytes.
    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            puts_stored: self.puts_stored.load(Ordering::Relaxed),
            puts_deduplicated: self.puts_deduplicated.load(Ordering::Relaxed),
            gets_found: self.gets_found.load(Ordering::Relaxed),
            gets_missing: self.gets_missing.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`StorageStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStatsSnapshot {
    pub batches: u64,
    pub puts_stored: u64,
    pub puts_deduplicated: u64,
    pub gets_found: u64,
    pub gets_missing: u64,
    pub tasks_failed: u64,
    pub faults: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.root, PathBuf::from(DEFAULT_STORAGE_ROOT));
        assert!(config.sync_writes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = StorageConfig::with_root("");
        assert!(config.validate().is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let config = StorageConfig::with_root(file.path());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stats_recording() {
        let stats = StorageStats::default();

        stats.record_batch(&BatchSummary {
            puts_stored: 3,
            puts_deduplicated: 2,
            gets_found: 4,
            gets_missing: 1,
            failed: 0,
            ..Default::default()
        });
        stats.record_write(300);
        stats.record_read(120);
        stats.record_fault();

        let snap = stats.snapshot();
        assert_eq!(snap.batches, 1);
        assert_eq!(snap.puts_stored, 3);
        assert_eq!(snap.puts_deduplicated, 2);
        assert_eq!(snap.gets_found, 4);
        assert_eq!(snap.gets_missing, 1);
        assert_eq!(snap.bytes_written, 300);
        assert_eq!(snap.bytes_read, 120);
        assert_eq!(snap.faults, 1);

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"puts_stored\":3"));
    }
}
