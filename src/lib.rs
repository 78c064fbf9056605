//! Archivist - Content-Addressed Deduplicating Blob Store
//!
//! Blobs are addressed by their content hash. The top bits of the hash pick
//! a bucket, the bucket picks the storage node, and each node batches work
//! per bucket so that one disk pass serves many requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────────────────┐   ┌──────────────────────────────────────┐
//! │ Client  │──▶│ Router                   │──▶│ StorageNode × N                      │
//! │         │   │  Sharder                 │   │  Accumulator ─▶ WorkerPool           │
//! │         │   │  proxy thread per node   │   │      ▲               │               │
//! │         │◀──│  response dispatchers    │◀──│   Sweeper      StorageEngine         │
//! └─────────┘   └──────────────────────────┘   │                 (bucket.index/.data) │
//!                                              └──────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`shard`] - Hash to bucket to server mapping
//! - [`task`] - Requests, content hashes and task statuses
//! - [`storage`] - Per-bucket index and append-only data files
//! - [`accumulator`] - Per-bucket queues and the priority ready-queue
//! - [`scheduler`] - Worker pool feeding batches to the storage engine
//! - [`router`] - Request routing and response fan-out
//! - [`node`] - One storage node's components wired together
//! - [`client`] - Response sinks and the client handle
//! - [`cluster`] - In-process bootstrap
//! - [`config`] - File-based configuration
//! - [`error`] - Error types

pub mod accumulator;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod router;
pub mod scheduler;
pub mod shard;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use client::{ChannelSink, ResponseSink, StorageClient};
pub use cluster::Cluster;
pub use config::ArchiveConfig;
pub use error::{Error, Result, StorageFault};
pub use router::{NodeEndpoint, Router};
pub use shard::{BucketId, ServerId, Sharder};
pub use storage::{ResponseHandler, StorageEngine};
pub use task::{ContentHash, Outcome, Request, RequestId, TaskStatus};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
