//! Process-wide configuration
//!
//! One flat [`ArchiveConfig`] covers every component. It deserializes from
//! YAML with durations given in milliseconds, for example:
//!
//! ```yaml
//! storage_root: /var/lib/archivist
//! nodes: 3
//! workers: 4
//! bucket_bits: 7
//! batch_size: 100
//! max_wait_ms: 1000
//! sweep_interval_ms: 100
//! ```
//!
//! Missing keys take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accumulator::{AccumulatorConfig, DEFAULT_BATCH_SIZE};
use crate::error::{Error, Result};
use crate::node::NodeConfig;
use crate::router::{RouterConfig, DEFAULT_RESPONSE_DISPATCHERS};
use crate::scheduler::{SchedulerConfig, DEFAULT_WORKERS};
use crate::shard::DEFAULT_BUCKET_BITS;
use crate::storage::{StorageConfig, DEFAULT_STORAGE_ROOT};

/// Configuration of an in-process archive cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Root directory; node `i` stores under `<root>/node-<i>`
    pub storage_root: PathBuf,

    /// Number of storage nodes
    pub nodes: usize,

    /// Worker threads per node
    pub workers: usize,

    /// Bits of the content hash used as bucket id
    pub bucket_bits: u32,

    /// Pending requests that make a bucket ready
    pub batch_size: usize,

    /// Starvation bound before the sweep interval, in milliseconds
    pub max_wait_ms: u64,

    /// Starvation sweep period, in milliseconds
    pub sweep_interval_ms: u64,

    /// Router response dispatcher threads
    pub response_dispatchers: usize,

    /// Priority weight of pending request count
    pub size_weight: f64,

    /// Priority weight of milliseconds waited
    pub wait_weight: f64,

    /// fsync data and index files
    pub sync_writes: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        let accumulator = AccumulatorConfig::default();
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            nodes: 1,
            workers: DEFAULT_WORKERS,
            bucket_bits: DEFAULT_BUCKET_BITS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait_ms: accumulator.max_wait.as_millis() as u64,
            sweep_interval_ms: accumulator.sweep_interval.as_millis() as u64,
            response_dispatchers: DEFAULT_RESPONSE_DISPATCHERS,
            size_weight: accumulator.size_weight,
            wait_weight: accumulator.wait_weight,
            sync_writes: true,
        }
    }
}

impl ArchiveConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(Error::Config("nodes must be at least 1".into()));
        }
        self.router_config().validate()?;
        for i in 0..self.nodes {
            self.node_config(i).validate()?;
        }
        Ok(())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            bucket_bits: self.bucket_bits,
            response_dispatchers: self.response_dispatchers,
        }
    }

    pub fn accumulator_config(&self) -> AccumulatorConfig {
        AccumulatorConfig {
            batch_size: self.batch_size,
            max_wait: Duration::from_millis(self.max_wait_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            size_weight: self.size_weight,
            wait_weight: self.wait_weight,
        }
    }

    /// Storage directory of node `index`.
    pub fn node_root(&self, index: usize) -> PathBuf {
        self.storage_root.join(format!("node-{}", index))
    }

    pub fn node_config(&self, index: usize) -> NodeConfig {
        NodeConfig {
            accumulator: self.accumulator_config(),
            storage: StorageConfig {
                root: self.node_root(index),
                sync_writes: self.sync_writes,
            },
            scheduler: SchedulerConfig {
                workers: self.workers,
                name: format!("node-{}", index),
            },
        }
    }
}
