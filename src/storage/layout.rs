//! Bucket file naming.

use std::path::{Path, PathBuf};

use crate::shard::BucketId;

/// Extension of a bucket's index file
pub const INDEX_EXTENSION: &str = "index";

/// Extension of a bucket's data file
pub const DATA_EXTENSION: &str = "data";

/// Resolves the index and data file paths of each bucket under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLayout {
    root: PathBuf,
}

impl BucketLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<bucket>.index`
    pub fn index_path(&self, bucket: BucketId) -> PathBuf {
        self.root.join(format!("{}.{}", bucket.0, INDEX_EXTENSION))
    }

    /// `<root>/<bucket>.data`
    pub fn data_path(&self, bucket: BucketId) -> PathBuf {
        self.root.join(format!("{}.{}", bucket.0, DATA_EXTENSION))
    }

    /// Create the root directory if it does not exist yet.
    pub fn ensure_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
