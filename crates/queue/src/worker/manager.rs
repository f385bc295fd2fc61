//! Supervisor for a set of sync workers

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::stats::WorkerStatsSnapshot;
use super::sync_worker::{StoreHandles, SyncWorker};
use crate::config::QueueConfig;
use crate::handler::HandlerRegistry;
use crate::lease::LeaseReaper;

/// Manager lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    /// No workers running
    Stopped,
    /// Workers are polling
    Running,
    /// Stop requested, waiting for in-flight batches
    Draining,
}

struct RunningWorkers {
    workers: Vec<Arc<SyncWorker>>,
    handles: Vec<JoinHandle<()>>,
    reaper_shutdown: watch::Sender<bool>,
    reaper_handle: JoinHandle<()>,
}

struct ManagerState {
    status: ManagerStatus,
    running: Option<RunningWorkers>,
    /// Flips to `true` when the drain in progress has finished
    drained: Option<watch::Receiver<bool>>,
    /// Counters of workers from earlier runs
    retired: WorkerStatsSnapshot,
}

/// Starts and stops a group of [`SyncWorker`]s plus one [`LeaseReaper`]
///
/// An explicit instance; create one per process (or per test) and share it
/// by reference.
///
/// # Example
///
/// ```ignore
/// let manager = WorkerManager::new(StoreHandles::shared(store), registry, config);
///
/// manager.start(4);
/// // ... until shutdown
/// manager.stop().await;
/// ```
pub struct WorkerManager {
    stores: StoreHandles,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    state: Arc<Mutex<ManagerState>>,
}

impl WorkerManager {
    pub fn new(stores: StoreHandles, registry: Arc<HandlerRegistry>, config: QueueConfig) -> Self {
        Self {
            stores,
            registry,
            config,
            state: Arc::new(Mutex::new(ManagerState {
                status: ManagerStatus::Stopped,
                running: None,
                drained: None,
                retired: WorkerStatsSnapshot::default(),
            })),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn `count` workers and the lease reaper
    ///
    /// Must be called inside a Tokio runtime. Does nothing (with a warning)
    /// when already running or when `count` is zero.
    pub fn start(&self, count: usize) {
        let mut state = self.state.lock();

        if state.status != ManagerStatus::Stopped {
            warn!(status = ?state.status, "Worker manager already started, ignoring start");
            return;
        }
        if count == 0 {
            warn!("Worker manager asked to start zero workers, ignoring");
            return;
        }

        info!(
            workers = count,
            prefix = %self.config.worker_id_prefix,
            batch_size = self.config.batch_size,
            lease_ttl_secs = self.config.lease_ttl.as_secs(),
            "Starting sync workers"
        );

        let workers: Vec<Arc<SyncWorker>> = (0..count)
            .map(|index| {
                Arc::new(SyncWorker::new(
                    self.config.worker_id(index),
                    self.stores.clone(),
                    Arc::clone(&self.registry),
                    &self.config,
                ))
            })
            .collect();

        let handles = workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        let (reaper_shutdown, reaper_rx) = watch::channel(false);
        let reaper_handle = LeaseReaper::new(
            Arc::clone(&self.stores.leases),
            self.config.reap_interval,
            reaper_rx,
        )
        .spawn();

        state.running = Some(RunningWorkers {
            workers,
            handles,
            reaper_shutdown,
            reaper_handle,
        });
        state.status = ManagerStatus::Running;
    }

    /// Start [`QueueConfig::worker_count`] workers
    pub fn start_default(&self) {
        self.start(self.config.worker_count);
    }

    /// Signal every worker and the reaper, then wait for them to exit
    ///
    /// Batches in flight are finished first. Concurrent callers all wait for
    /// the same drain, which runs in its own task and completes even if this
    /// future is dropped. Calling `stop` when stopped is a no-op.
    pub async fn stop(&self) {
        let mut drained = {
            let mut state = self.state.lock();
            match state.status {
                ManagerStatus::Stopped => {
                    debug!("Worker manager not running, ignoring stop");
                    return;
                }
                ManagerStatus::Draining => {}
                ManagerStatus::Running => match state.running.take() {
                    Some(running) => {
                        let (drained_tx, drained_rx) = watch::channel(false);
                        state.status = ManagerStatus::Draining;
                        state.drained = Some(drained_rx);
                        tokio::spawn(drain(running, Arc::clone(&self.state), drained_tx));
                    }
                    None => {
                        state.status = ManagerStatus::Stopped;
                        return;
                    }
                },
            }

            match state.drained.clone() {
                Some(drained) => drained,
                None => return,
            }
        };

        if drained.wait_for(|done| *done).await.is_err() {
            warn!("Drain task ended without signalling completion");
        }
    }

    /// Run `work` with `count` workers started, stopping them afterwards
    ///
    /// Workers are stopped even if `work` panics; the panic is resumed once
    /// they have exited.
    pub async fn scoped<F, T>(&self, count: usize, work: F) -> T
    where
        F: Future<Output = T>,
    {
        self.start(count);
        let result = AssertUnwindSafe(work).catch_unwind().await;
        self.stop().await;

        match result {
            Ok(output) => output,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub fn status(&self) -> ManagerStatus {
        self.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == ManagerStatus::Running
    }

    /// Ids of the workers currently running
    pub fn worker_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .running
            .as_ref()
            .map(|r| r.workers.iter().map(|w| w.worker_id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Counters summed over every worker this manager has run
    pub fn stats(&self) -> WorkerStatsSnapshot {
        let state = self.state.lock();
        let live: WorkerStatsSnapshot = state
            .running
            .as_ref()
            .map(|r| r.workers.iter().map(|w| w.stats()).sum())
            .unwrap_or_default();
        state.retired + live
    }
}

/// Stop one run's workers and reaper, then mark the manager stopped
async fn drain(
    running: RunningWorkers,
    state: Arc<Mutex<ManagerState>>,
    drained: watch::Sender<bool>,
) {
    info!(workers = running.workers.len(), "Stopping sync workers");

    for worker in &running.workers {
        worker.stop();
    }
    let _ = running.reaper_shutdown.send(true);

    for (worker, result) in running
        .workers
        .iter()
        .zip(join_all(running.handles).await)
    {
        if let Err(e) = result {
            error!(worker_id = %worker.worker_id(), "Worker task failed: {}", e);
        }
    }
    if let Err(e) = running.reaper_handle.await {
        error!("Lease reaper task failed: {}", e);
    }

    let finished: WorkerStatsSnapshot = running.workers.iter().map(|w| w.stats()).sum();

    {
        let mut state = state.lock();
        state.retired = state.retired + finished;
        state.status = ManagerStatus::Stopped;
        state.drained = None;
        info!(stats = ?state.retired, "Sync workers stopped");
    }

    let _ = drained.send(true);
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
