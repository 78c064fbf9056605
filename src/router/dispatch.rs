//! Response dispatchers - fan status batches back to client sinks.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::RouterStats;
use crate::client::ResponseSink;
use crate::task::{ClientId, TaskStatus};

pub(crate) type SinkTable = DashMap<ClientId, Arc<dyn ResponseSink>>;

/// Pop status batches until the response queue is closed.
pub(crate) fn run(
    worker: usize,
    rx: Receiver<Vec<TaskStatus>>,
    sinks: &SinkTable,
    stats: &RouterStats,
) {
    debug!("Response dispatcher {} running", worker);

    for batch in rx {
        stats.response_batches.fetch_add(1, Ordering::Relaxed);
        deliver(batch, sinks, stats);
    }

    debug!("Response dispatcher {} stopped", worker);
}

/// Group `batch` by origin and hand each group to its client's sink.
pub(crate) fn deliver(batch: Vec<TaskStatus>, sinks: &SinkTable, stats: &RouterStats) {
    let mut by_client: HashMap<ClientId, Vec<TaskStatus>> = HashMap::new();
    for status in batch {
        by_client.entry(status.origin).or_default().push(status);
    }

    for (client, statuses) in by_client {
        // Clone out of the map so no shard lock is held during delivery
        let sink = sinks.get(&client).map(|entry| Arc::clone(entry.value()));
        let count = statuses.len() as u64;

        match sink {
            Some(sink) => {
                sink.deliver(statuses);
                stats.responses_delivered.fetch_add(count, Ordering::Relaxed);
            }
            None => {
                warn!("No sink for client {}, dropping {} statuses", client, count);
                stats.responses_undeliverable.fetch_add(count, Ordering::Relaxed);
            }
        }
    }
}
