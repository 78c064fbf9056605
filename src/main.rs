//! Archivist
//!
//! Runs an in-process archive cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Archivist                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Client    │───▶│    Router    │───▶│ Storage Node │ × N   │
//! │  │    (demo)    │◀───│  (sharding)  │◀───│  (batching)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use archivist::{ArchiveConfig, Cluster, ContentHash, Outcome, StorageClient};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Archivist - content-addressed deduplicating blob store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "ARCHIVIST_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root directory
    #[arg(long, env = "ARCHIVIST_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Number of in-process storage nodes
    #[arg(long, env = "ARCHIVIST_NODES")]
    nodes: Option<usize>,

    /// Worker threads per node
    #[arg(long, env = "ARCHIVIST_WORKERS")]
    workers: Option<usize>,

    /// Bits of the content hash used as bucket id
    #[arg(long, env = "ARCHIVIST_BUCKET_BITS")]
    bucket_bits: Option<u32>,

    /// Pending requests that make a bucket ready
    #[arg(long, env = "ARCHIVIST_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Maximum wait before a bucket is forced ready, in milliseconds
    #[arg(long, env = "ARCHIVIST_MAX_WAIT_MS")]
    max_wait_ms: Option<u64>,

    /// Starvation sweep period, in milliseconds
    #[arg(long, env = "ARCHIVIST_SWEEP_INTERVAL_MS")]
    sweep_interval_ms: Option<u64>,

    /// Response dispatcher threads
    #[arg(long, env = "ARCHIVIST_DISPATCHERS")]
    dispatchers: Option<usize>,

    /// Store and read back this many generated blobs at startup
    #[arg(long, env = "ARCHIVIST_DEMO_BLOBS", default_value = "0")]
    demo_blobs: usize,

    /// Exit after the demo workload instead of waiting for Ctrl-C
    #[arg(long, env = "ARCHIVIST_EXIT_AFTER_DEMO")]
    exit_after_demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File configuration with command-line overrides applied.
    fn archive_config(&self) -> anyhow::Result<ArchiveConfig> {
        let mut config = match &self.config {
            Some(path) => ArchiveConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ArchiveConfig::default(),
        };

        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(nodes) = self.nodes {
            config.nodes = nodes;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(bits) = self.bucket_bits {
            config.bucket_bits = bits;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(ms) = self.max_wait_ms {
            config.max_wait_ms = ms;
        }
        if let Some(ms) = self.sweep_interval_ms {
            config.sweep_interval_ms = ms;
        }
        if let Some(dispatchers) = self.dispatchers {
            config.response_dispatchers = dispatchers;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.archive_config()?;

    info!("Starting Archivist {}", archivist::version());
    info!("  Storage root: {}", config.storage_root.display());
    info!("  Nodes: {}", config.nodes);
    info!("  Workers per node: {}", config.workers);
    info!("  Bucket bits: {}", config.bucket_bits);
    info!(
        "  Batch size: {}, max wait: {} ms",
        config.batch_size, config.max_wait_ms
    );

    let cluster = std::sync::Arc::new(Cluster::start(&config).context("starting cluster")?);

    if args.demo_blobs > 0 {
        let demo_cluster = cluster.clone();
        let blobs = args.demo_blobs;
        let deadline = Duration::from_millis(config.max_wait_ms + config.sweep_interval_ms) * 4;

        tokio::task::spawn_blocking(move || run_demo(&demo_cluster.client(), blobs, deadline))
            .await
            .context("demo workload panicked")?;
    }

    if !args.exit_after_demo {
        info!("Running, press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    }

    info!("Shutting down");
    let status = tokio::task::spawn_blocking(move || {
        cluster.shutdown();
        cluster.status()
    })
    .await
    .context("shutdown panicked")?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    info!("Archivist shutdown complete");
    Ok(())
}

// =============================================================================
// Demo Workload
// =============================================================================

fn demo_blob(i: usize) -> Vec<u8> {
    format!("archivist demo blob #{:08}\n", i)
        .repeat(1 + i % 16)
        .into_bytes()
}

/// Put `count` blobs, put them again, then read every one back.
fn run_demo(client: &StorageClient, count: usize, deadline: Duration) {
    let started = Instant::now();

    let mut hashes: Vec<ContentHash> = Vec::with_capacity(count);
    let mut ids = Vec::with_capacity(count * 2);
    for round in 0..2 {
        for i in 0..count {
            match client.put(demo_blob(i)) {
                Ok((id, hash)) => {
                    ids.push(id);
                    if round == 0 {
                        hashes.push(hash);
                    }
                }
                Err(e) => warn!("Demo put {} failed: {}", i, e),
            }
        }
    }

    let stored = client.wait_all(&ids, deadline);
    let unanswered = ids.iter().filter(|id| client.is_pending(**id)).count();
    if unanswered > 0 {
        warn!("Demo: {} puts still unanswered after {:?}", unanswered, deadline);
    }
    let deduplicated = stored
        .iter()
        .filter(|s| s.outcome == Outcome::Stored { deduplicated: true })
        .count();
    info!(
        "Demo: {} of {} puts acknowledged, {} deduplicated",
        stored.len(),
        ids.len(),
        deduplicated
    );

    let ids: Vec<_> = hashes
        .iter()
        .filter_map(|hash| client.get(hash.clone()).ok())
        .collect();
    let fetched = client.wait_all(&ids, deadline);

    let intact = fetched
        .iter()
        .filter(|s| {
            s.data()
                .map(|d| ContentHash::digest(d) == s.hash)
                .unwrap_or(false)
        })
        .count();
    info!(
        "Demo: {} of {} blobs read back intact in {:?}",
        intact,
        hashes.len(),
        started.elapsed()
    );

    let latencies: Vec<Duration> = stored.iter().chain(&fetched).map(|s| s.latency()).collect();
    if let Some(max) = latencies.iter().max() {
        let mean = latencies.iter().sum::<Duration>() / latencies.len() as u32;
        info!("Demo: request latency mean {:?}, max {:?}", mean, max);
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
