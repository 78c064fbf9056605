//! Router - request routing and response fan-out
//!
//! # Request Path
//!
//! ```text
//!   route_request ─▶ Sharder ─▶ proxy queue[server] ─▶ proxy thread ─▶ node.assign_task
//! ```
//!
//! # Response Path
//!
//! ```text
//!   engine ─▶ process_response ─▶ response queue ─▶ dispatcher × N ─▶ sink[client]
//! ```
//!
//! Callers never block on node I/O: routing only pushes onto an unbounded
//! per-server queue. Node membership is fixed once registered; server ids
//! are assigned in registration order and never reused.

mod dispatch;
mod proxy;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::client::ResponseSink;
use crate::error::{Error, Result};
use crate::shard::{BucketId, ServerId, Sharder, DEFAULT_BUCKET_BITS};
use crate::storage::ResponseHandler;
use crate::task::{ClientId, Request, TaskStatus};

use dispatch::SinkTable;
use proxy::ServerProxy;

/// Response dispatcher threads
pub const DEFAULT_RESPONSE_DISPATCHERS: usize = 2;

/// Node side of the routing RPC surface.
pub trait NodeEndpoint: Send + Sync {
    /// Hand one request to the node owning `bucket`.
    fn assign_task(&self, bucket: BucketId, request: Request) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Bits of the content hash used as bucket id
    pub bucket_bits: u32,

    /// Threads delivering statuses to client sinks
    pub response_dispatchers: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bucket_bits: DEFAULT_BUCKET_BITS,
            response_dispatchers: DEFAULT_RESPONSE_DISPATCHERS,
        }
    }
}

impl RouterConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Sharder::new(self.bucket_bits)?;
        if self.response_dispatchers == 0 {
            return Err(Error::Config(
                "response_dispatchers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the Router.
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Requests accepted by route_request
    pub requests_routed: AtomicU64,

    /// Requests a proxy handed to its node
    pub requests_forwarded: AtomicU64,

    /// Requests dropped because the node rejected them
    pub transport_failures: AtomicU64,

    /// Status batches received from engines
    pub response_batches: AtomicU64,

    /// Statuses handed to a client sink
    pub responses_delivered: AtomicU64,

    /// Statuses for clients without a sink
    pub responses_undeliverable: AtomicU64,
}

impl RouterStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            requests_routed: self.requests_routed.load(Ordering::Relaxed),
            requests_forwarded: self.requests_forwarded.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            response_batches: self.response_batches.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            responses_undeliverable: self.responses_undeliverable.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`RouterStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatsSnapshot {
    pub requests_routed: u64,
    pub requests_forwarded: u64,
    pub transport_failures: u64,
    pub response_batches: u64,
    pub responses_delivered: u64,
    pub responses_undeliverable: u64,
}

// =============================================================================
// Router
// =============================================================================

/// Routes requests to their owning nodes and statuses back to clients.
pub struct Router {
    /// Configuration
    config: RouterConfig,

    /// Hash to bucket mapping
    sharder: Sharder,

    /// One proxy per registered node, indexed by server id
    proxies: RwLock<Vec<ServerProxy>>,

    /// Registered client sinks
    sinks: Arc<SinkTable>,

    /// Next client id
    next_client_id: AtomicU64,

    /// Response queue, `None` once closed
    responses: RwLock<Option<Sender<Vec<TaskStatus>>>>,

    /// Dispatcher threads
    dispatchers: Mutex<Vec<JoinHandle<()>>>,

    /// Set once intake is closed
    closed: AtomicBool,

    /// Statistics
    stats: Arc<RouterStats>,
}

impl Router {
    /// Create a new Router and start its response dispatchers.
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;
        let sharder = Sharder::new(config.bucket_bits)?;

        let sinks: Arc<SinkTable> = Arc::new(DashMap::new());
        let stats = Arc::new(RouterStats::default());
        let (tx, rx) = channel::unbounded();

        let mut dispatchers = Vec::with_capacity(config.response_dispatchers);
        for i in 0..config.response_dispatchers {
            let rx = rx.clone();
            let sinks = Arc::clone(&sinks);
            let stats = Arc::clone(&stats);
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-{}", i))
                .spawn(move || dispatch::run(i, rx, &sinks, &stats))
                .map_err(|e| Error::Internal(format!("Failed to spawn dispatcher {}: {}", i, e)))?;
            dispatchers.push(handle);
        }

        info!(
            "Router: {} buckets, {} response dispatchers",
            sharder.bucket_count(),
            config.response_dispatchers
        );

        Ok(Self {
            config,
            sharder,
            proxies: RwLock::new(Vec::new()),
            sinks,
            next_client_id: AtomicU64::new(1),
            responses: RwLock::new(Some(tx)),
            dispatchers: Mutex::new(dispatchers),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn sharder(&self) -> &Sharder {
        &self.sharder
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.proxies.read().len()
    }

    /// Register a node and start its proxy. Ids are handed out in order.
    pub fn register_node(&self, endpoint: Arc<dyn NodeEndpoint>) -> Result<ServerId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown { component: "router" });
        }

        let mut proxies = self.proxies.write();
        let server_id = ServerId(proxies.len());
        proxies.push(ServerProxy::start(
            server_id,
            endpoint,
            Arc::clone(&self.stats),
        )?);

        info!("Registered server {}", server_id);
        Ok(server_id)
    }

    /// Route `request` to the node owning its bucket.
    #[instrument(skip(self, request), fields(id = %request.id(), kind = %request.kind()))]
    pub fn route_request(&self, request: Request) -> Result<(BucketId, ServerId)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown { component: "router" });
        }

        let proxies = self.proxies.read();
        if proxies.is_empty() {
            return Err(Error::NoNodes);
        }

        let (bucket, server) = self.sharder.route(request.hash(), proxies.len());
        let proxy = proxies
            .get(server.0)
            .ok_or_else(|| Error::Internal(format!("no proxy for server {}", server)))?;
        proxy.submit(bucket, request)?;

        self.stats.requests_routed.fetch_add(1, Ordering::Relaxed);
        debug!("Routed to bucket {} on server {}", bucket, server);
        Ok((bucket, server))
    }

    // =========================================================================
    // Response Sinks
    // =========================================================================

    /// Register a sink. Requests carrying the returned id are answered to it.
    pub fn set_response_sink(&self, sink: Arc<dyn ResponseSink>) -> ClientId {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.insert(id, sink);
        debug!("Registered sink for client {}", id);
        id
    }

    /// Swap the sink of an existing client. Returns false for unknown ids.
    pub fn replace_response_sink(&self, client: ClientId, sink: Arc<dyn ResponseSink>) -> bool {
        match self.sinks.get_mut(&client) {
            Some(mut entry) => {
                *entry = sink;
                true
            }
            None => false,
        }
    }

    /// Unregister a client's sink.
    pub fn remove_response_sink(&self, client: ClientId) -> bool {
        self.sinks.remove(&client).is_some()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop accepting requests and wait until every proxy forwarded its queue.
    pub fn close_intake(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut proxies = self.proxies.write();
        for proxy in proxies.iter_mut() {
            proxy.shutdown();
        }
        debug!("Router intake closed");
    }

    /// Close intake, then the response queue, and join every router thread.
    ///
    /// Statuses already queued are still delivered.
    pub fn shutdown(&self) {
        self.close_intake();

        self.responses.write().take();
        let handles: Vec<JoinHandle<()>> = self.dispatchers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("Response dispatcher panicked");
            }
        }
        info!("Router shut down");
    }
}

impl ResponseHandler for Router {
    fn process_response(&self, batch: Vec<TaskStatus>) {
        if batch.is_empty() {
            return;
        }

        let sent = match self.responses.read().as_ref() {
            Some(tx) => tx.send(batch).map_err(|e| e.into_inner()),
            None => Err(batch),
        };

        if let Err(batch) = sent {
            warn!("Response queue closed, dropping {} statuses", batch.len());
            self.stats
                .responses_undeliverable
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChannelSink;
    use crate::task::{ContentHash, Outcome};
    use std::time::Duration;

    /// Endpoint recording every assignment.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(BucketId, Request)>>,
    }

    impl NodeEndpoint for Recorder {
        fn assign_task(&self, bucket: BucketId, request: Request) -> Result<()> {
            self.seen.lock().push((bucket, request));
            Ok(())
        }
    }

    /// Endpoint rejecting every assignment.
    struct Unreachable;

    impl NodeEndpoint for Unreachable {
        fn assign_task(&self, _bucket: BucketId, _request: Request) -> Result<()> {
            Err(Error::Internal("connection refused".into()))
        }
    }

    fn router(bits: u32) -> Router {
        Router::new(RouterConfig {
            bucket_bits: bits,
            response_dispatchers: 2,
        })
        .unwrap()
    }

    fn hash_with_prefix(first: u8) -> ContentHash {
        let mut bytes = vec![0u8; 32];
        bytes[0] = first;
        ContentHash::from(bytes)
    }

    #[test]
    fn test_config_validation() {
        assert!(RouterConfig::default().validate().is_ok());

        let config = RouterConfig {
            bucket_bits: 33,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::ShardingConfig { bits: 33, .. })
        ));

        let config = RouterConfig {
            response_dispatchers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_route_without_nodes_fails() {
        let router = router(3);
        let request = Request::get(ClientId(1), hash_with_prefix(0));
        assert!(matches!(router.route_request(request), Err(Error::NoNodes)));
    }

    #[test]
    fn test_server_ids_in_registration_order() {
        let router = router(3);
        for expected in 0..3 {
            let id = router.register_node(Arc::new(Recorder::default())).unwrap();
            assert_eq!(id, ServerId(expected));
        }
        assert_eq!(router.node_count(), 3);
    }

    #[test]
    fn test_requests_reach_owning_node_in_order() {
        let router = router(3);
        let nodes: Vec<Arc<Recorder>> = (0..2).map(|_| Arc::new(Recorder::default())).collect();
        for node in &nodes {
            router.register_node(node.clone()).unwrap();
        }

        // Top three bits: 0b101 -> bucket 5 -> server 1
        let hash = hash_with_prefix(0b1010_0000);
        let first = Request::get(ClientId(1), hash.clone());
        let second = Request::get(ClientId(1), hash);
        let ids = vec![first.id(), second.id()];

        assert_eq!(
            router.route_request(first).unwrap(),
            (BucketId(5), ServerId(1))
        );
        router.route_request(second).unwrap();
        router.close_intake();

        assert!(nodes[0].seen.lock().is_empty());
        let seen = nodes[1].seen.lock();
        let seen_ids: Vec<_> = seen.iter().map(|(_, r)| r.id()).collect();
        assert_eq!(seen_ids, ids);
        assert!(seen.iter().all(|(b, _)| *b == BucketId(5)));
        assert_eq!(router.stats().snapshot().requests_forwarded, 2);
    }

    #[test]
    fn test_transport_failure_is_dropped() {
        let router = router(1);
        router.register_node(Arc::new(Unreachable)).unwrap();

        let result = router.route_request(Request::get(ClientId(1), hash_with_prefix(0)));
        assert!(result.is_ok());
        router.close_intake();

        let snap = router.stats().snapshot();
        assert_eq!(snap.requests_routed, 1);
        assert_eq!(snap.transport_failures, 1);
    }

    #[test]
    fn test_route_after_shutdown_rejected() {
        let router = router(1);
        router.register_node(Arc::new(Recorder::default())).unwrap();
        router.shutdown();

        let result = router.route_request(Request::get(ClientId(1), hash_with_prefix(0)));
        assert!(matches!(result, Err(Error::ShutDown { .. })));
    }

    #[test]
    fn test_responses_fan_out_by_client() {
        let router = router(1);
        let (sink_a, rx_a) = ChannelSink::new();
        let (sink_b, rx_b) = ChannelSink::new();
        let a = router.set_response_sink(Arc::new(sink_a));
        let b = router.set_response_sink(Arc::new(sink_b));
        assert_ne!(a, b);

        let ra = Request::get(a, hash_with_prefix(1));
        let rb = Request::get(b, hash_with_prefix(2));
        router.process_response(vec![
            TaskStatus::answer(&ra, Outcome::NotFound),
            TaskStatus::answer(&rb, Outcome::NotFound),
        ]);

        let timeout = Duration::from_secs(5);
        assert_eq!(rx_a.recv_timeout(timeout).unwrap().id, ra.id());
        assert_eq!(rx_b.recv_timeout(timeout).unwrap().id, rb.id());
    }

    #[test]
    fn test_unknown_client_statuses_dropped() {
        let router = router(1);
        let request = Request::get(ClientId(999), hash_with_prefix(1));
        router.process_response(vec![TaskStatus::answer(&request, Outcome::NotFound)]);
        router.shutdown();

        assert_eq!(router.stats().snapshot().responses_undeliverable, 1);
    }

    #[test]
    fn test_replace_and_remove_sink() {
        let router = router(1);
        let (first, _rx_first) = ChannelSink::new();
        let (second, rx_second) = ChannelSink::new();
        let client = router.set_response_sink(Arc::new(first));

        assert!(router.replace_response_sink(client, Arc::new(second)));
        let request = Request::get(client, hash_with_prefix(1));
        router.process_response(vec![TaskStatus::answer(&request, Outcome::NotFound)]);
        assert!(rx_second.recv_timeout(Duration::from_secs(5)).is_ok());

        assert!(router.remove_response_sink(client));
        assert!(!router.remove_response_sink(client));
        let (third, _) = ChannelSink::new();
        assert!(!router.replace_response_sink(client, Arc::new(third)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let router = router(1);
        router.shutdown();
        router.shutdown();
    }
}
