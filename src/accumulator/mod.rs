//! Accumulator - per-bucket batching in front of the storage engine
//!
//! Requests are queued per bucket until the bucket is worth a disk pass,
//! then handed to a worker as a single [`Batch`].
//!
//! # Workflow
//!
//! ```text
//!   enqueue(bucket, req)
//!          │
//!          ▼
//!   ┌──────────────┐  pending >= batch_size   ┌─────────────┐  take()   ┌────────┐
//!   │ bucket queue │ ───────────────────────▶ │ ready-queue │ ────────▶ │ worker │
//!   │ gets │ puts  │                          │ (priority)  │           └────────┘
//!   └──────────────┘ ───────────────────────▶ └─────────────┘
//!          waited >= max_wait (sweeper)
//! ```
//!
//! A bucket sits in the ready-queue at most once. When a worker takes it,
//! its queues and timer are removed in the same critical section, so a
//! request can never end up in two batches.
//!
//! # Priority
//!
//! `size_weight * pending + wait_weight * waited_ms`, evaluated at take time
//! so both growth and age raise a ready bucket's rank.

mod sweeper;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::shard::BucketId;
use crate::task::{Request, TaskKind};

pub use sweeper::Sweeper;

// =============================================================================
// Constants
// =============================================================================

/// Pending requests that make a bucket ready
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Longest time a bucket may wait before it is forced ready
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(1000);

/// Starvation sweep period
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorConfig {
    /// Pending requests (gets + puts) that make a bucket ready
    pub batch_size: usize,

    /// Wait after which an unscheduled bucket is forced ready
    pub max_wait: Duration,

    /// How often the sweeper looks for starved buckets
    pub sweep_interval: Duration,

    /// Priority weight of pending request count
    pub size_weight: f64,

    /// Priority weight of milliseconds waited
    pub wait_weight: f64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            size_weight: 1.0,
            wait_weight: 1.0,
        }
    }
}

impl AccumulatorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.max_wait.is_zero() {
            return Err(Error::Config("max_wait must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep_interval must be positive".into()));
        }
        for (name, weight) in [
            ("size_weight", self.size_weight),
            ("wait_weight", self.wait_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }
        Ok(())
    }

    /// Worst-case time from a bucket's first request to it becoming ready.
    pub fn starvation_bound(&self) -> Duration {
        self.max_wait + self.sweep_interval
    }
}

// =============================================================================
// Batch
// =============================================================================

/// Everything queued for one bucket, handed to a single worker.
#[derive(Debug)]
pub struct Batch {
    pub bucket: BucketId,
    pub gets: Vec<Request>,
    pub puts: Vec<Request>,
    /// When the batch was taken from the ready-queue
    pub started_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.gets.len() + self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gets.is_empty() && self.puts.is_empty()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the Accumulator.
#[derive(Debug, Default)]
pub struct AccumulatorStats {
    /// Put requests queued
    pub puts_enqueued: AtomicU64,

    /// Get requests queued
    pub gets_enqueued: AtomicU64,

    /// Buckets made ready by reaching the batch size
    pub threshold_admissions: AtomicU64,

    /// Buckets made ready by the starvation sweep
    pub starvation_admissions: AtomicU64,

    /// Buckets made ready by close
    pub close_admissions: AtomicU64,

    /// Batches handed to workers
    pub batches_taken: AtomicU64,

    /// Requests handed to workers
    pub requests_taken: AtomicU64,
}

impl AccumulatorStats {
    fn record_enqueue(&self, kind: TaskKind) {
        match kind {
            TaskKind::Put => self.puts_enqueued.fetch_add(1, Ordering::Relaxed),
            TaskKind::Get => self.gets_enqueued.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_take(&self, batch: &Batch) {
        self.batches_taken.fetch_add(1, Ordering::Relaxed);
        self.requests_taken
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> AccumulatorStatsSnapshot {
        AccumulatorStatsSnapshot {
            puts_enqueued: self.puts_enqueued.load(Ordering::Relaxed),
            gets_enqueued: self.gets_enqueued.load(Ordering::Relaxed),
            threshold_admissions: self.threshold_admissions.load(Ordering::Relaxed),
            starvation_admissions: self.starvation_admissions.load(Ordering::Relaxed),
            close_admissions: self.close_admissions.load(Ordering::Relaxed),
            batches_taken: self.batches_taken.load(Ordering::Relaxed),
            requests_taken: self.requests_taken.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`AccumulatorStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorStatsSnapshot {
    pub puts_enqueued: u64,
    pub gets_enqueued: u64,
    pub threshold_admissions: u64,
    pub starvation_admissions: u64,
    pub close_admissions: u64,
    pub batches_taken: u64,
    pub requests_taken: u64,
}

// =============================================================================
// Accumulator
// =============================================================================

/// Requests waiting for one bucket.
#[derive(Debug)]
struct BucketQueue {
    gets: Vec<Request>,
    puts: Vec<Request>,
    /// First arrival since the last hand-off
    opened_at: Instant,
    /// Whether the bucket is in the ready-queue (its timer is cancelled)
    ready: bool,
}

impl BucketQueue {
    fn new(now: Instant) -> Self {
        Self {
            gets: Vec::new(),
            puts: Vec::new(),
            opened_at: now,
            ready: false,
        }
    }

    fn pending(&self) -> usize {
        self.gets.len() + self.puts.len()
    }
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<BucketId, BucketQueue>,
    ready: BTreeSet<BucketId>,
    closed: bool,
}

impl State {
    /// Insert into the ready-queue. Returns false if already there.
    fn admit(&mut self, bucket: BucketId) -> bool {
        match self.buckets.get_mut(&bucket) {
            Some(queue) if !queue.ready => {
                queue.ready = true;
                self.ready.insert(bucket)
            }
            _ => false,
        }
    }
}

/// Per-bucket request queues plus the priority ready-queue.
pub struct Accumulator {
    /// Configuration
    config: AccumulatorConfig,

    /// Queues, timers and ready-queue behind one lock
    state: Mutex<State>,

    /// Signalled when a bucket becomes ready or on close
    available: Condvar,

    /// Statistics
    stats: AccumulatorStats,
}

impl Accumulator {
    /// Create a new Accumulator.
    pub fn new(config: AccumulatorConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "Accumulator: batch_size={}, max_wait={:?}, sweep_interval={:?}",
            config.batch_size, config.max_wait, config.sweep_interval
        );

        Ok(Self {
            config,
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            stats: AccumulatorStats::default(),
        })
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &AccumulatorStats {
        &self.stats
    }

    /// Queue a put request.
    pub fn enqueue_put(&self, bucket: BucketId, request: Request) -> Result<()> {
        self.enqueue(bucket, request)
    }

    /// Queue a get request.
    pub fn enqueue_get(&self, bucket: BucketId, request: Request) -> Result<()> {
        self.enqueue(bucket, request)
    }

    /// Queue a request on its bucket's get or put queue, by request kind.
    pub fn enqueue(&self, bucket: BucketId, request: Request) -> Result<()> {
        let kind = request.kind();
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ShutDown {
                component: "accumulator",
            });
        }

        let queue = state
            .buckets
            .entry(bucket)
            .or_insert_with(|| BucketQueue::new(Instant::now()));
        match kind {
            TaskKind::Put => queue.puts.push(request),
            TaskKind::Get => queue.gets.push(request),
        }
        let pending = queue.pending();
        self.stats.record_enqueue(kind);

        if pending >= self.config.batch_size && state.admit(bucket) {
            self.stats
                .threshold_admissions
                .fetch_add(1, Ordering::Relaxed);
            trace!("Bucket {} ready with {} pending", bucket, pending);
            drop(state);
            self.available.notify_one();
        }
        Ok(())
    }

    /// Block until a bucket is ready and remove its queues.
    ///
    /// Returns `None` once the accumulator is closed and the ready-queue is
    /// drained.
    pub fn take(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        loop {
            if let Some(batch) = self.pop_ready(&mut state) {
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Take a ready bucket without blocking.
    pub fn try_take(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        self.pop_ready(&mut state)
    }

    fn pop_ready(&self, state: &mut State) -> Option<Batch> {
        let now = Instant::now();
        let bucket = state
            .ready
            .iter()
            .filter_map(|bucket| {
                state
                    .buckets
                    .get(bucket)
                    .map(|queue| (self.priority(queue, now), *bucket))
            })
            // Ties go to the lowest bucket id
            .max_by(|(pa, ba), (pb, bb)| pa.total_cmp(pb).then(bb.cmp(ba)))
            .map(|(_, bucket)| bucket)?;

        state.ready.remove(&bucket);
        let queue = state.buckets.remove(&bucket)?;

        let batch = Batch {
            bucket,
            gets: queue.gets,
            puts: queue.puts,
            started_at: now,
        };
        self.stats.record_take(&batch);
        debug!(
            "Handing off bucket {}: {} gets, {} puts, waited {:?}",
            bucket,
            batch.gets.len(),
            batch.puts.len(),
            now.saturating_duration_since(queue.opened_at)
        );
        Some(batch)
    }

    fn priority(&self, queue: &BucketQueue, now: Instant) -> f64 {
        let waited_ms = now.saturating_duration_since(queue.opened_at).as_secs_f64() * 1000.0;
        self.config.size_weight * queue.pending() as f64 + self.config.wait_weight * waited_ms
    }

    /// Force every bucket that has waited at least `max_wait` at `now` into
    /// the ready-queue. Returns the number of buckets admitted.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<BucketId> = state
            .buckets
            .iter()
            .filter(|(_, q)| {
                !q.ready && now.saturating_duration_since(q.opened_at) >= self.config.max_wait
            })
            .map(|(bucket, _)| *bucket)
            .collect();

        let admitted = expired
            .into_iter()
            .filter(|bucket| state.admit(*bucket))
            .count();
        drop(state);

        if admitted > 0 {
            self.stats
                .starvation_admissions
                .fetch_add(admitted as u64, Ordering::Relaxed);
            debug!("Starvation sweep admitted {} buckets", admitted);
            self.available.notify_all();
        }
        admitted
    }

    /// Stop accepting requests. Every bucket still queued is made ready so
    /// workers drain it before [`take`](Self::take) returns `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let pending: Vec<BucketId> = state.buckets.keys().copied().collect();
        let admitted = pending
            .into_iter()
            .filter(|bucket| state.admit(*bucket))
            .count();
        drop(state);

        self.stats
            .close_admissions
            .fetch_add(admitted as u64, Ordering::Relaxed);
        info!("Accumulator closed, {} buckets flushed", admitted);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Requests queued for `bucket` and not yet taken.
    pub fn pending_count(&self, bucket: BucketId) -> usize {
        self.state
            .lock()
            .buckets
            .get(&bucket)
            .map_or(0, BucketQueue::pending)
    }

    /// Whether `bucket` is in the ready-queue.
    pub fn is_ready(&self, bucket: BucketId) -> bool {
        self.state.lock().ready.contains(&bucket)
    }

    /// Number of buckets in the ready-queue.
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
