//! Server proxy - one outbound queue and thread per storage node.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use super::{NodeEndpoint, RouterStats};
use crate::error::{Error, Result};
use crate::shard::{BucketId, ServerId};
use crate::task::Request;

type Assignment = (BucketId, Request);

/// Forwards assignments to one node in FIFO order without blocking callers.
pub(crate) struct ServerProxy {
    server_id: ServerId,
    tx: Option<Sender<Assignment>>,
    handle: Option<JoinHandle<()>>,
}

impl ServerProxy {
    pub(crate) fn start(
        server_id: ServerId,
        endpoint: Arc<dyn NodeEndpoint>,
        stats: Arc<RouterStats>,
    ) -> Result<Self> {
        let (tx, rx) = channel::unbounded();

        let handle = std::thread::Builder::new()
            .name(format!("proxy-{}", server_id))
            .spawn(move || run(server_id, endpoint.as_ref(), rx, &stats))
            .map_err(|e| Error::Internal(format!("Failed to spawn proxy {}: {}", server_id, e)))?;

        Ok(Self {
            server_id,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue an assignment.
    pub(crate) fn submit(&self, bucket: BucketId, request: Request) -> Result<()> {
        let closed = || Error::ShutDown {
            component: "server proxy",
        };
        self.tx
            .as_ref()
            .ok_or_else(closed)?
            .send((bucket, request))
            .map_err(|_| closed())
    }

    /// Close the queue and wait until everything queued was forwarded.
    pub(crate) fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Proxy for server {} panicked", self.server_id);
            }
        }
    }
}

impl Drop for ServerProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(server_id: ServerId, endpoint: &dyn NodeEndpoint, rx: Receiver<Assignment>, stats: &RouterStats) {
    debug!("Proxy for server {} running", server_id);

    for (bucket, request) in rx {
        let id = request.id();
        match endpoint.assign_task(bucket, request) {
            Ok(()) => {
                stats.requests_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.transport_failures.fetch_add(1, Ordering::Relaxed);
                let err = Error::Transport {
                    server_id,
                    reason: e.to_string(),
                };
                warn!("Dropping request {} for bucket {}: {}", id, bucket, err);
            }
        }
    }

    debug!("Proxy for server {} stopped", server_id);
}
