//! Storage Node
//!
//! One node owns the buckets `b` with `b mod node_count == server_id`. It
//! bundles the pieces serving them:
//!
//! ```text
//!   assign_task ─▶ Accumulator ◀── Sweeper
//!                      │
//!                      ▼ take()
//!                  WorkerPool ─▶ StorageEngine ─▶ ResponseHandler
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::accumulator::{Accumulator, AccumulatorConfig, AccumulatorStatsSnapshot, Sweeper};
use crate::error::Result;
use crate::router::NodeEndpoint;
use crate::scheduler::{SchedulerConfig, WorkerPool};
use crate::shard::BucketId;
use crate::storage::{ResponseHandler, StorageConfig, StorageEngine, StorageStatsSnapshot};
use crate::task::Request;

/// Combined configuration of one node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub accumulator: AccumulatorConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

impl NodeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.accumulator.validate()?;
        self.storage.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Summary of one node, for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub running: bool,
    /// False once the accumulator stopped taking requests
    pub accepting: bool,
    pub accumulator: AccumulatorStatsSnapshot,
    pub storage: StorageStatsSnapshot,
}

/// Background threads, stopped together.
struct Runtime {
    sweeper: Sweeper,
    pool: WorkerPool,
}

/// A running storage node.
pub struct StorageNode {
    name: String,
    accumulator: Arc<Accumulator>,
    engine: Arc<StorageEngine>,
    runtime: Mutex<Option<Runtime>>,
}

impl StorageNode {
    /// Build the node's components and start its sweeper and workers.
    pub fn start(
        name: impl Into<String>,
        config: NodeConfig,
        responder: Arc<dyn ResponseHandler>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;

        let accumulator = Arc::new(Accumulator::new(config.accumulator)?);
        let engine = Arc::new(StorageEngine::new(config.storage, responder)?);

        let scheduler = SchedulerConfig {
            name: name.clone(),
            ..config.scheduler
        };
        let pool = WorkerPool::start(&scheduler, Arc::clone(&accumulator), Arc::clone(&engine))?;
        let sweeper = Sweeper::start(&name, Arc::clone(&accumulator))?;

        info!(
            "Storage node {} started at {}",
            name,
            engine.layout().root().display()
        );

        Ok(Self {
            name,
            accumulator,
            engine,
            runtime: Mutex::new(Some(Runtime { sweeper, pool })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name.clone(),
            running: self.is_running(),
            accepting: !self.accumulator.is_closed(),
            accumulator: self.accumulator.stats().snapshot(),
            storage: self.engine.stats().snapshot(),
        }
    }

    /// Stop the sweeper, flush every queued bucket and join the workers.
    pub fn shutdown(&self) {
        let Some(mut runtime) = self.runtime.lock().take() else {
            return;
        };
        runtime.sweeper.shutdown();
        runtime.pool.shutdown();
        info!("Storage node {} stopped", self.name);
    }
}

impl NodeEndpoint for StorageNode {
    fn assign_task(&self, bucket: BucketId, request: Request) -> Result<()> {
        trace!("{} assigned {} for bucket {}", self.name, request.id(), bucket);
        self.accumulator.enqueue(bucket, request)
    }
}

impl Drop for StorageNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::task::{ClientId, ContentHash, Outcome, TaskStatus};
    use crossbeam::channel::{self, Sender};
    use std::time::Duration;

    struct Forward(Sender<TaskStatus>);

    impl ResponseHandler for Forward {
        fn process_response(&self, batch: Vec<TaskStatus>) {
            for status in batch {
                let _ = self.0.send(status);
            }
        }
    }

    fn node(root: &std::path::Path, batch_size: usize) -> (StorageNode, channel::Receiver<TaskStatus>) {
        let (tx, rx) = channel::unbounded();
        let config = NodeConfig {
            accumulator: AccumulatorConfig {
                batch_size,
                max_wait: Duration::from_millis(40),
                sweep_interval: Duration::from_millis(10),
                ..Default::default()
            },
            storage: StorageConfig::with_root(root),
            scheduler: SchedulerConfig {
                workers: 2,
                ..Default::default()
            },
        };
        let node = StorageNode::start("node-test", config, Arc::new(Forward(tx))).unwrap();
        (node, rx)
    }

    #[test]
    fn test_assigned_tasks_are_answered() {
        let dir = tempfile::tempdir().unwrap();
        let (node, rx) = node(dir.path(), 2);

        let data = b"node payload".to_vec();
        let hash = ContentHash::digest(&data);
        node.assign_task(BucketId(1), Request::put(ClientId(1), hash.clone(), data))
            .unwrap();
        node.assign_task(BucketId(1), Request::get(ClientId(1), hash))
            .unwrap();

        let mut outcomes = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap().outcome,
            rx.recv_timeout(Duration::from_secs(5)).unwrap().outcome,
        ];
        outcomes.sort_by_key(|o| matches!(o, Outcome::Found(_)));
        assert_eq!(outcomes[0], Outcome::Stored { deduplicated: false });
        assert!(matches!(&outcomes[1], Outcome::Found(d) if &d[..] == b"node payload"));
    }

    #[test]
    fn test_lone_request_answered_by_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let (node, rx) = node(dir.path(), 100);

        node.assign_task(
            BucketId(0),
            Request::get(ClientId(1), ContentHash::from(vec![7; 32])),
        )
        .unwrap();

        let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status.outcome, Outcome::NotFound);
        assert_eq!(node.status().accumulator.starvation_admissions, 1);
    }

    #[test]
    fn test_shutdown_flushes_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (node, rx) = node(dir.path(), 100);

        let data = vec![1u8, 2, 3];
        node.assign_task(
            BucketId(3),
            Request::put(ClientId(1), ContentHash::digest(&data), data),
        )
        .unwrap();
        assert!(node.status().accepting);
        node.shutdown();
        assert!(!node.is_running());
        assert!(!node.status().accepting);

        assert!(rx.try_recv().unwrap().is_success());
        let rejected = node.assign_task(
            BucketId(3),
            Request::get(ClientId(1), ContentHash::from(vec![0])),
        );
        assert!(matches!(rejected, Err(Error::ShutDown { .. })));
    }
}
