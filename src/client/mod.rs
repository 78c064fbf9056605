//! Client-side handles
//!
//! A client registers a [`ResponseSink`] with the router and stamps every
//! request it submits with the [`ClientId`] it got back. The router's
//! response dispatchers call the sink with every status addressed to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::router::Router;
use crate::shard::{BucketId, ServerId};
use crate::task::{ClientId, ContentHash, Request, RequestId, TaskStatus};

/// Destination of the statuses addressed to one client.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, statuses: Vec<TaskStatus>);
}

/// Sink forwarding every status into a channel.
pub struct ChannelSink {
    tx: Sender<TaskStatus>,
}

impl ChannelSink {
    /// Create a sink and the receiver its statuses arrive on.
    pub fn new() -> (Self, Receiver<TaskStatus>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ResponseSink for ChannelSink {
    fn deliver(&self, statuses: Vec<TaskStatus>) {
        for status in statuses {
            if self.tx.send(status).is_err() {
                trace!("Receiver dropped, discarding status");
                return;
            }
        }
    }
}

/// Outstanding requests plus the channel their statuses are forwarded to.
struct Inbox {
    pending: DashMap<RequestId, Instant>,
    tx: Sender<TaskStatus>,
}

impl ResponseSink for Inbox {
    fn deliver(&self, statuses: Vec<TaskStatus>) {
        for status in statuses {
            self.pending.remove(&status.id);
            let _ = self.tx.send(status);
        }
    }
}

/// Handle for submitting puts and gets and collecting their results.
pub struct StorageClient {
    id: ClientId,
    router: Arc<Router>,
    inbox: Arc<Inbox>,
    rx: Receiver<TaskStatus>,
    /// Statuses received while waiting for a different request
    stash: Mutex<HashMap<RequestId, TaskStatus>>,
}

impl StorageClient {
    /// Register a new client with `router`.
    pub fn connect(router: Arc<Router>) -> Self {
        let (tx, rx) = channel::unbounded();
        let inbox = Arc::new(Inbox {
            pending: DashMap::new(),
            tx,
        });
        let id = router.set_response_sink(inbox.clone());
        debug!("Client {} connected", id);

        Self {
            id,
            router,
            inbox,
            rx,
            stash: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Store `data` under its SHA-256 digest.
    pub fn put(&self, data: impl Into<Bytes>) -> Result<(RequestId, ContentHash)> {
        let data = data.into();
        let hash = ContentHash::digest(&data);
        let id = self.put_with_hash(hash.clone(), data)?;
        Ok((id, hash))
    }

    /// Store `data` under a caller-computed hash.
    pub fn put_with_hash(&self, hash: ContentHash, data: impl Into<Bytes>) -> Result<RequestId> {
        self.submit(Request::put(self.id, hash, data))
            .map(|(id, _, _)| id)
    }

    /// Fetch the data stored under `hash`.
    pub fn get(&self, hash: ContentHash) -> Result<RequestId> {
        self.submit(Request::get(self.id, hash)).map(|(id, _, _)| id)
    }

    /// Route a prepared request. Returns its id and where it was routed.
    pub fn submit(&self, request: Request) -> Result<(RequestId, BucketId, ServerId)> {
        let id = request.id();
        self.inbox.pending.insert(id, request.submitted_at());

        match self.router.route_request(request) {
            Ok((bucket, server)) => Ok((id, bucket, server)),
            Err(e) => {
                self.inbox.pending.remove(&id);
                Err(e)
            }
        }
    }

    /// Requests submitted and not answered yet.
    pub fn pending(&self) -> usize {
        self.inbox.pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.inbox.pending.contains_key(&id)
    }

    /// Wait up to `timeout` for the status of request `id`.
    pub fn wait_for(&self, id: RequestId, timeout: Duration) -> Option<TaskStatus> {
        if let Some(status) = self.stash.lock().remove(&id) {
            return Some(status);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(status) if status.id == id => return Some(status),
                Ok(status) => {
                    self.stash.lock().insert(status.id, status);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Wait for every id in `ids`, in order. Stops at the first timeout.
    pub fn wait_all(&self, ids: &[RequestId], timeout: Duration) -> Vec<TaskStatus> {
        let deadline = Instant::now() + timeout;
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait_for(*id, remaining) {
                Some(status) => statuses.push(status),
                None => break,
            }
        }
        statuses
    }

    /// Next status for any request, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TaskStatus> {
        let stashed = {
            let mut stash = self.stash.lock();
            let id = stash.keys().next().copied();
            id.and_then(|id| stash.remove(&id))
        };
        stashed.or_else(|| self.rx.recv_timeout(timeout).ok())
    }
}

impl Drop for StorageClient {
    fn drop(&mut self) {
        self.router.remove_response_sink(self.id);
    }
}
