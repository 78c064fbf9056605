//! Error types for Archivist
//!
//! Two families live here:
//!
//! - [`Error`]: failures returned from constructors and control-plane calls.
//!   Configuration errors are fatal at startup.
//! - [`StorageFault`]: a per-batch disk failure. It is cloneable so a single
//!   fault can be attached to every task status it affected.

use thiserror::Error;

use crate::shard::{BucketId, ServerId};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Archivist
#[derive(Error, Debug)]
pub enum Error {
    /// Bucket bit width does not fit the bucket id
    #[error("Sharding configuration error: {bits} bucket bits exceeds the maximum of {max_bits}")]
    ShardingConfig { bits: u32, max_bits: u32 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage fault surfaced outside of a batch
    #[error(transparent)]
    Storage(#[from] StorageFault),

    /// No storage node has registered with the router
    #[error("No storage nodes registered")]
    NoNodes,

    /// Remote call to a storage node failed
    #[error("Transport to server {server_id} failed: {reason}")]
    Transport { server_id: ServerId, reason: String },

    /// Component is shut down and no longer accepts work
    #[error("{component} is shut down")]
    ShutDown { component: &'static str },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Which storage step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Index file could not be read
    IndexRead,
    /// Index file could not be written
    IndexWrite,
    /// Index file exists but does not decode
    IndexCorrupt,
    /// Appending to the data file failed
    DataWrite,
    /// Reading from the data file failed
    DataRead,
    /// Batch processing stopped before producing a status
    Aborted,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::IndexRead => write!(f, "index read"),
            FaultKind::IndexWrite => write!(f, "index write"),
            FaultKind::IndexCorrupt => write!(f, "index corrupt"),
            FaultKind::DataWrite => write!(f, "data write"),
            FaultKind::DataRead => write!(f, "data read"),
            FaultKind::Aborted => write!(f, "aborted"),
        }
    }
}

/// Disk failure while processing one bucket's batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Storage fault ({kind}) in bucket {bucket}: {detail}")]
pub struct StorageFault {
    /// Failed step
    pub kind: FaultKind,
    /// Bucket being processed
    pub bucket: BucketId,
    /// Underlying cause, rendered
    pub detail: String,
}

impl StorageFault {
    /// Create a new fault.
    pub fn new(kind: FaultKind, bucket: BucketId, detail: impl Into<String>) -> Self {
        Self {
            kind,
            bucket,
            detail: detail.into(),
        }
    }

    /// Wrap an I/O error.
    pub fn io(kind: FaultKind, bucket: BucketId, err: &std::io::Error) -> Self {
        Self::new(kind, bucket, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharding_error_message() {
        let err = Error::ShardingConfig {
            bits: 40,
            max_bits: 32,
        };
        assert_eq!(
            err.to_string(),
            "Sharding configuration error: 40 bucket bits exceeds the maximum of 32"
        );
    }

    #[test]
    fn test_storage_fault_display() {
        let fault = StorageFault::new(FaultKind::DataRead, BucketId(3), "short read");
        assert_eq!(
            fault.to_string(),
            "Storage fault (data read) in bucket 3: short read"
        );

        let err: Error = fault.clone().into();
        assert_eq!(err.to_string(), fault.to_string());
    }
}
