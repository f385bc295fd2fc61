//! Periodic cleanup of abandoned leases

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::LeaseStore;
use crate::persistence::StoreError;

/// Shortest interval the reaper ticks at; smaller values are raised to it
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// Background task that clears expired leases
///
/// Runs independently of any single worker so a crashed worker cannot strand
/// its entries. Stops when the shared shutdown signal flips to `true`.
pub struct LeaseReaper {
    leases: Arc<dyn LeaseStore>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl LeaseReaper {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        if interval < MIN_REAP_INTERVAL {
            warn!(
                interval_ms = interval.as_millis() as u64,
                "Reap interval too small, using {:?}",
                MIN_REAP_INTERVAL
            );
        }

        Self {
            leases,
            interval: interval.max(MIN_REAP_INTERVAL),
            shutdown_rx,
        }
    }

    /// Run one reap pass
    pub async fn reap_once(&self) -> Result<u64, StoreError> {
        let reaped = self.leases.reap().await?;
        if reaped > 0 {
            info!(count = reaped, "Reaped expired leases");
        }
        Ok(reaped)
    }

    /// Spawn the reaper loop onto the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Reap on every tick until shutdown
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!("Lease reap failed: {}", e);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    debug!("Reaper loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Reaper loop exited");
    }
}
