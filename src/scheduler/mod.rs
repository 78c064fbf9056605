//! Scheduler - worker pool draining the accumulator
//!
//! Every worker loops: take the highest-priority ready bucket, run its batch
//! through the storage engine, repeat. Workers are interchangeable and block
//! on the accumulator's condition variable while nothing is ready.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::accumulator::{Accumulator, Batch};
use crate::error::{Error, FaultKind, Result, StorageFault};
use crate::shard::BucketId;
use crate::storage::StorageEngine;
use crate::task::{Outcome, Request, TaskStatus};

/// Workers per node
pub const DEFAULT_WORKERS: usize = 4;

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Thread name prefix
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            name: "archivist".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Batches run to completion
    pub batches_completed: AtomicU64,

    /// Batches that panicked
    pub batches_panicked: AtomicU64,
}

/// Fixed pool of OS threads feeding batches to the storage engine.
pub struct WorkerPool {
    accumulator: Arc<Accumulator>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SchedulerStats>,
}

impl WorkerPool {
    /// Spawn the workers.
    pub fn start(
        config: &SchedulerConfig,
        accumulator: Arc<Accumulator>,
        engine: Arc<StorageEngine>,
    ) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(SchedulerStats::default());
        let mut handles = Vec::with_capacity(config.workers);

        for i in 0..config.workers {
            let accumulator = Arc::clone(&accumulator);
            let engine = Arc::clone(&engine);
            let stats = Arc::clone(&stats);

            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", config.name, i))
                .spawn(move || worker_loop(i, &accumulator, &engine, &stats))
                .map_err(|e| Error::Internal(format!("Failed to spawn worker {}: {}", i, e)))?;
            handles.push(handle);
        }

        info!("Started {} workers for {}", config.workers, config.name);

        Ok(Self {
            accumulator,
            handles,
            stats,
        })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Close the accumulator and wait for the workers to drain it.
    pub fn shutdown(&mut self) {
        self.accumulator.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker: usize,
    accumulator: &Accumulator,
    engine: &StorageEngine,
    stats: &SchedulerStats,
) {
    debug!("Worker {} started", worker);

    while let Some(batch) = accumulator.take() {
        let bucket = batch.bucket;
        let requests: Vec<Request> = batch.gets.iter().chain(&batch.puts).cloned().collect();
        let result = catch_unwind(AssertUnwindSafe(|| run_batch(engine, batch)));

        match result {
            Ok(_) => {
                stats.batches_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                stats.batches_panicked.fetch_add(1, Ordering::Relaxed);
                error!("Worker {} panicked processing bucket {}", worker, bucket);
                fail_batch(engine, bucket, &requests);
            }
        }
    }

    debug!("Worker {} exiting", worker);
}

fn run_batch(engine: &StorageEngine, batch: Batch) {
    engine.process_batch(batch.bucket, batch.gets, batch.puts, batch.started_at);
}

/// Answer every task of a batch that panicked, so no client waits forever.
fn fail_batch(engine: &StorageEngine, bucket: BucketId, requests: &[Request]) {
    let fault = StorageFault::new(FaultKind::Aborted, bucket, "batch processing panicked");
    let statuses: Vec<TaskStatus> = requests
        .iter()
        .map(|r| TaskStatus::answer(r, Outcome::Failed(fault.clone())))
        .collect();

    // The responder itself may be what panicked
    let delivered = catch_unwind(AssertUnwindSafe(|| {
        engine.responder().process_response(statuses)
    }));
    if delivered.is_err() {
        error!(
            "Failed to deliver {} aborted statuses for bucket {}",
            requests.len(),
            bucket
        );
    }
}
