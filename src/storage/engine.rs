//! Storage Engine - deduplicated batch I/O per bucket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::index::{BucketIndex, DataEntry, MAX_HASH_LEN};
use super::layout::BucketLayout;
use super::segment;
use super::{StorageConfig, StorageStats};
use crate::error::{FaultKind, Result, StorageFault};
use crate::shard::BucketId;
use crate::task::{ContentHash, Operation, Outcome, Request, TaskStatus};

/// Receives the statuses of every finished batch.
///
/// The router implements this to fan results back to clients.
pub trait ResponseHandler: Send + Sync {
    fn process_response(&self, batch: Vec<TaskStatus>);
}

/// Counts of one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub bucket: BucketId,
    pub puts_stored: usize,
    pub puts_deduplicated: usize,
    pub gets_found: usize,
    pub gets_missing: usize,
    pub failed: usize,
    /// Time spent between hand-off and completion
    pub elapsed: Duration,
}

impl BatchSummary {
    fn from_statuses(bucket: BucketId, statuses: &[TaskStatus], elapsed: Duration) -> Self {
        let mut summary = Self {
            bucket,
            elapsed,
            ..Default::default()
        };
        for status in statuses {
            match &status.outcome {
                Outcome::Stored { deduplicated: true } => summary.puts_deduplicated += 1,
                Outcome::Stored {
                    deduplicated: false,
                } => summary.puts_stored += 1,
                Outcome::Found(_) => summary.gets_found += 1,
                Outcome::NotFound => summary.gets_missing += 1,
                Outcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Number of tasks answered.
    pub fn total(&self) -> usize {
        self.puts_stored + self.puts_deduplicated + self.gets_found + self.gets_missing + self.failed
    }
}

/// A put borrowed out of its request.
struct PutRef<'a> {
    request: &'a Request,
    hash: &'a ContentHash,
    data: &'a Bytes,
}

/// How a put is answered once the append is done.
enum PutPlan {
    /// Already in the index before this batch
    Duplicate,
    /// Payload staged in this batch; `first` for the request that staged it
    Staged { first: bool },
    /// Rejected before any I/O
    Rejected(StorageFault),
}

/// A present-hash get waiting to be read.
#[derive(Debug)]
pub(crate) struct ReadOp<'a> {
    pub entry: DataEntry,
    pub request: &'a Request,
}

/// Per-bucket index and data-file management.
pub struct StorageEngine {
    /// Configuration
    config: StorageConfig,

    /// File naming
    layout: BucketLayout,

    /// One lock per bucket, created on first use
    locks: DashMap<BucketId, Arc<Mutex<()>>>,

    /// Destination of batch results
    responder: Arc<dyn ResponseHandler>,

    /// Statistics
    stats: Arc<StorageStats>,
}

impl StorageEngine {
    /// Create a new Storage Engine.
    pub fn new(config: StorageConfig, responder: Arc<dyn ResponseHandler>) -> Result<Self> {
        config.validate()?;

        info!("Storage engine rooted at {}", config.root.display());

        Ok(Self {
            layout: BucketLayout::new(config.root.clone()),
            config,
            locks: DashMap::new(),
            responder,
            stats: Arc::new(StorageStats::default()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    pub fn responder(&self) -> &Arc<dyn ResponseHandler> {
        &self.responder
    }

    /// Process one batch and forward its statuses to the response handler.
    #[instrument(skip(self, bucket, gets, puts, batch_start), fields(bucket = %bucket, gets = gets.len(), puts = puts.len()))]
    pub fn process_batch(
        &self,
        bucket: BucketId,
        gets: Vec<Request>,
        puts: Vec<Request>,
        batch_start: Instant,
    ) -> BatchSummary {
        let statuses = self.execute_batch(bucket, &gets, &puts);
        let summary = BatchSummary::from_statuses(bucket, &statuses, batch_start.elapsed());

        if summary.total() > 0 {
            self.stats.record_batch(&summary);
            debug!(
                "Batch done: {} stored, {} deduplicated, {} found, {} missing, {} failed in {:?}",
                summary.puts_stored,
                summary.puts_deduplicated,
                summary.gets_found,
                summary.gets_missing,
                summary.failed,
                summary.elapsed
            );
            self.responder.process_response(statuses);
        }

        summary
    }

    /// Run one batch under the bucket lock and return a status per task.
    ///
    /// Puts are applied before gets, so a get in the same batch observes the
    /// puts stored by it. Requests are classified by their own kind.
    pub fn execute_batch(
        &self,
        bucket: BucketId,
        gets: &[Request],
        puts: &[Request],
    ) -> Vec<TaskStatus> {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock();

        if gets.is_empty() && puts.is_empty() {
            return Vec::new();
        }

        let mut writes = Vec::with_capacity(puts.len());
        let mut reads = Vec::with_capacity(gets.len());
        for request in puts.iter().chain(gets.iter()) {
            match request.operation() {
                Operation::Put { hash, data } => writes.push(PutRef {
                    request,
                    hash,
                    data,
                }),
                Operation::Get { .. } => reads.push(request),
            }
        }

        let mut index = match self.load_index(bucket) {
            Ok(index) => index,
            Err(fault) => {
                warn!("Failing batch for bucket {}: {}", bucket, fault);
                self.stats.record_fault();
                return writes
                    .iter()
                    .map(|w| w.request)
                    .chain(reads.iter().copied())
                    .map(|r| TaskStatus::answer(r, Outcome::Failed(fault.clone())))
                    .collect();
            }
        };

        let mut statuses = Vec::with_capacity(writes.len() + reads.len());
        if !writes.is_empty() {
            statuses.extend(self.write_phase(&mut index, &writes));
        }
        if !reads.is_empty() {
            statuses.extend(self.read_phase(&index, &reads));
        }
        statuses
    }

    /// Load a bucket's index from disk, or an empty one if it was never
    /// written. Creates the storage root on first access.
    pub fn load_index(&self, bucket: BucketId) -> std::result::Result<BucketIndex, StorageFault> {
        if !self.layout.root().exists() {
            self.layout
                .ensure_root()
                .map_err(|e| StorageFault::io(FaultKind::IndexRead, bucket, &e))?;
            return Ok(BucketIndex::new(bucket));
        }

        Ok(BucketIndex::load(bucket, &self.layout.index_path(bucket))?
            .unwrap_or_else(|| BucketIndex::new(bucket)))
    }

    fn bucket_lock(&self, bucket: BucketId) -> Arc<Mutex<()>> {
        self.locks
            .entry(bucket)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Write Phase
    // =========================================================================

    fn write_phase(&self, index: &mut BucketIndex, writes: &[PutRef<'_>]) -> Vec<TaskStatus> {
        let bucket = index.bucket();

        // Hashes staged in this batch collapse to a single write
        let mut staged: Vec<(&ContentHash, &Bytes)> = Vec::new();
        let mut seen: HashSet<&ContentHash> = HashSet::new();
        let mut plans = Vec::with_capacity(writes.len());

        for put in writes {
            let plan = if put.hash.len() > MAX_HASH_LEN {
                PutPlan::Rejected(StorageFault::new(
                    FaultKind::DataWrite,
                    bucket,
                    format!("hash of {} bytes exceeds the index limit", put.hash.len()),
                ))
            } else if index.contains(put.hash) {
                PutPlan::Duplicate
            } else if seen.contains(put.hash) {
                PutPlan::Staged { first: false }
            } else if put.data.len() > u32::MAX as usize {
                PutPlan::Rejected(StorageFault::new(
                    FaultKind::DataWrite,
                    bucket,
                    format!("payload of {} bytes exceeds the entry limit", put.data.len()),
                ))
            } else {
                staged.push((put.hash, put.data));
                seen.insert(put.hash);
                PutPlan::Staged { first: true }
            };
            plans.push(plan);
        }

        let write_fault = if staged.is_empty() {
            None
        } else {
            self.flush_staged(index, &staged).err()
        };

        if let Some(fault) = &write_fault {
            warn!("Write phase failed for bucket {}: {}", bucket, fault);
            self.stats.record_fault();
        }

        writes
            .iter()
            .zip(plans)
            .map(|(put, plan)| {
                let outcome = match plan {
                    PutPlan::Duplicate => Outcome::Stored { deduplicated: true },
                    PutPlan::Rejected(fault) => Outcome::Failed(fault),
                    PutPlan::Staged { first, .. } => match &write_fault {
                        Some(fault) => Outcome::Failed(fault.clone()),
                        None => Outcome::Stored {
                            deduplicated: !first,
                        },
                    },
                };
                TaskStatus::answer(put.request, outcome)
            })
            .collect()
    }

    /// Append staged payloads and persist the updated index. On a failed
    /// persist the new entries are rolled back out of `index`.
    fn flush_staged(
        &self,
        index: &mut BucketIndex,
        staged: &[(&ContentHash, &Bytes)],
    ) -> std::result::Result<(), StorageFault> {
        let bucket = index.bucket();
        self.layout
            .ensure_root()
            .map_err(|e| StorageFault::io(FaultKind::DataWrite, bucket, &e))?;

        let payloads: Vec<&Bytes> = staged.iter().map(|(_, data)| *data).collect();
        let entries = segment::append(
            &self.layout.data_path(bucket),
            &payloads,
            self.config.sync_writes,
        )
        .map_err(|e| StorageFault::io(FaultKind::DataWrite, bucket, &e))?;

        for ((hash, _), entry) in staged.iter().zip(&entries) {
            index.insert((*hash).clone(), *entry);
        }

        if let Err(fault) = index.persist(&self.layout.index_path(bucket), self.config.sync_writes) {
            for (hash, _) in staged {
                index.remove(hash);
            }
            return Err(fault);
        }

        let written: u64 = entries.iter().map(|e| e.length as u64).sum();
        self.stats.record_write(written);
        debug!(
            "Appended {} payloads ({} bytes) to bucket {}",
            entries.len(),
            written,
            bucket
        );
        Ok(())
    }

    // =========================================================================
    // Read Phase
    // =========================================================================

    fn read_phase(&self, index: &BucketIndex, reads: &[&Request]) -> Vec<TaskStatus> {
        let bucket = index.bucket();
        let (ops, missing) = plan_reads(index, reads);

        let mut statuses: Vec<TaskStatus> = missing
            .into_iter()
            .map(|r| {
                debug!("No data for hash {} in bucket {}", r.hash(), bucket);
                TaskStatus::answer(r, Outcome::NotFound)
            })
            .collect();

        if ops.is_empty() {
            return statuses;
        }

        let mut file = match segment::open(&self.layout.data_path(bucket)) {
            Ok(file) => file,
            Err(e) => {
                let fault = StorageFault::io(FaultKind::DataRead, bucket, &e);
                warn!("Read phase failed for bucket {}: {}", bucket, fault);
                self.stats.record_fault();
                statuses.extend(
                    ops.iter()
                        .map(|op| TaskStatus::answer(op.request, Outcome::Failed(fault.clone()))),
                );
                return statuses;
            }
        };

        let mut read_bytes = 0u64;
        for op in ops {
            let outcome = match segment::read_entry(&mut file, op.entry) {
                Ok(data) => {
                    read_bytes += data.len() as u64;
                    Outcome::Found(data)
                }
                Err(e) => {
                    self.stats.record_fault();
                    Outcome::Failed(StorageFault::io(FaultKind::DataRead, bucket, &e))
                }
            };
            statuses.push(TaskStatus::answer(op.request, outcome));
        }
        self.stats.record_read(read_bytes);

        statuses
    }
}

/// Split gets into reads sorted by disk offset and hashes the index lacks.
pub(crate) fn plan_reads<'a>(
    index: &BucketIndex,
    reads: &[&'a Request],
) -> (Vec<ReadOp<'a>>, Vec<&'a Request>) {
    let mut ops = Vec::with_capacity(reads.len());
    let mut missing = Vec::new();

    for request in reads {
        match index.get(request.hash()) {
            Some(entry) => ops.push(ReadOp { entry, request }),
            None => missing.push(*request),
        }
    }

    // Sequential scan of the data file instead of random seeks
    ops.sort_by_key(|op| op.entry);
    (ops, missing)
}

// =============================================================================
// Tests
// =============================================================================
