//! Starvation sweeper thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use tracing::{debug, info, warn};

use super::Accumulator;
use crate::error::{Error, Result};

/// Periodically forces starved buckets into the ready-queue.
pub struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start sweeping `accumulator` every `sweep_interval` of its config.
    pub fn start(name: &str, accumulator: Arc<Accumulator>) -> Result<Self> {
        let interval = accumulator.config().sweep_interval;
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name(format!("{}-sweeper", name))
            .spawn(move || run(accumulator, interval, stop_rx))
            .map_err(|e| Error::Internal(format!("Failed to spawn sweeper: {}", e)))?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the sweeper and wait for its thread.
    pub fn shutdown(&mut self) {
        // Dropping the sender disconnects the stop channel
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(accumulator: Arc<Accumulator>, interval: Duration, stop: channel::Receiver<()>) {
    info!("Starvation sweeper running every {:?}", interval);
    let ticker = channel::tick(interval);

    loop {
        channel::select! {
            recv(ticker) -> tick => {
                let now = tick.unwrap_or_else(|_| Instant::now());
                let admitted = accumulator.sweep_expired(now);
                if admitted > 0 {
                    debug!("Sweep forced {} buckets ready", admitted);
                }
            }
            recv(stop) -> _ => break,
        }
    }

    debug!("Starvation sweeper stopped");
}
