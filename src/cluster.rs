//! In-process cluster bootstrap.
//!
//! Builds one [`Router`] and `nodes` [`StorageNode`]s from an
//! [`ArchiveConfig`], registering node `i` as server `i`. Shutdown runs in
//! reverse: router intake first, then the nodes (which flush their queues),
//! then the response path, so no accepted request goes unanswered.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::client::StorageClient;
use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::node::{NodeStatus, StorageNode};
use crate::router::{Router, RouterStatsSnapshot};

/// A running router plus its storage nodes.
pub struct Cluster {
    router: Arc<Router>,
    nodes: Vec<Arc<StorageNode>>,
}

/// Statistics of every component, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub router: RouterStatsSnapshot,
    pub nodes: Vec<NodeStatus>,
}

impl Cluster {
    /// Validate `config` and start every component.
    ///
    /// If a node fails to start, everything started before it is stopped
    /// again before the error is returned.
    pub fn start(config: &ArchiveConfig) -> Result<Self> {
        config.validate()?;

        Self::start_with(config, |i, router| {
            let node =
                StorageNode::start(format!("node-{}", i), config.node_config(i), router.clone())?;
            Ok(Arc::new(node))
        })
    }

    fn start_with<F>(config: &ArchiveConfig, mut start_node: F) -> Result<Self>
    where
        F: FnMut(usize, &Arc<Router>) -> Result<Arc<StorageNode>>,
    {
        let router = Arc::new(Router::new(config.router_config())?);

        // Dropped on early return, which shuts down the partial cluster
        let mut cluster = Self {
            router,
            nodes: Vec::with_capacity(config.nodes),
        };

        for i in 0..config.nodes {
            let node = start_node(i, &cluster.router)?;
            cluster.router.register_node(node.clone())?;
            cluster.nodes.push(node);
        }

        info!(
            "Cluster started: {} nodes, {} buckets",
            cluster.nodes.len(),
            cluster.router.sharder().bucket_count()
        );

        Ok(cluster)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn nodes(&self) -> &[Arc<StorageNode>] {
        &self.nodes
    }

    /// Connect a new client.
    pub fn client(&self) -> StorageClient {
        StorageClient::connect(Arc::clone(&self.router))
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            router: self.router.stats().snapshot(),
            nodes: self.nodes.iter().map(|n| n.status()).collect(),
        }
    }

    /// Stop every component, answering everything already accepted.
    pub fn shutdown(&self) {
        self.router.close_intake();
        for node in &self.nodes {
            node.shutdown();
        }
        self.router.shutdown();
        info!("Cluster stopped");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::task::{ClientId, ContentHash, Request};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn config(root: &std::path::Path, nodes: usize) -> ArchiveConfig {
        ArchiveConfig {
            storage_root: root.to_path_buf(),
            nodes,
            workers: 2,
            bucket_bits: 3,
            batch_size: 4,
            max_wait_ms: 30,
            sweep_interval_ms: 10,
            sync_writes: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_registers_nodes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::start(&config(dir.path(), 3)).unwrap();

        assert_eq!(cluster.router().node_count(), 3);
        let names: Vec<&str> = cluster.nodes().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["node-0", "node-1", "node-2"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = config(dir.path(), 1);
        bad.bucket_bits = 64;
        assert!(Cluster::start(&bad).is_err());
    }

    #[test]
    fn test_shutdown_answers_accepted_requests() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::start(&ArchiveConfig {
            batch_size: 1000,
            max_wait_ms: 60_000,
            ..config(dir.path(), 2)
        })
        .unwrap();
        let client = cluster.client();

        let ids: Vec<_> = (0..10u8)
            .map(|n| client.put(vec![n; 16]).unwrap().0)
            .collect();
        cluster.shutdown();

        let statuses = client.wait_all(&ids, Duration::from_secs(5));
        assert_eq!(statuses.len(), 10);
        assert!(statuses.iter().all(|s| s.is_success()));
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn test_partial_start_stops_started_components() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 3);
        let mut started: Vec<Arc<StorageNode>> = Vec::new();
        let mut router: Option<Arc<Router>> = None;

        let result = Cluster::start_with(&config, |i, r| {
            router.get_or_insert_with(|| Arc::clone(r));
            if i == 1 {
                return Err(Error::Internal("node-1 refused to start".into()));
            }
            let node = Arc::new(StorageNode::start(
                format!("node-{}", i),
                config.node_config(i),
                r.clone(),
            )?);
            started.push(Arc::clone(&node));
            Ok(node)
        });
        assert_matches!(result.err(), Some(Error::Internal(_)));

        let router = router.unwrap();
        let request = Request::get(ClientId(0), ContentHash::digest(b"after failure"));
        assert_matches!(
            router.route_request(request),
            Err(Error::ShutDown { component: "router" })
        );

        assert_eq!(started.len(), 1);
        assert!(!started[0].is_running());
        assert!(started[0].accumulator().is_closed());
    }
}
