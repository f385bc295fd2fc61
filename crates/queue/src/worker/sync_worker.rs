//! Poll/dispatch loop for a single worker

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::stats::{WorkerStats, WorkerStatsSnapshot};
use crate::config::QueueConfig;
use crate::handler::{EntityHandler, HandlerError, HandlerRegistry, SyncOutcome};
use crate::lease::LeaseStore;
use crate::persistence::{EntryFailure, QueueEntry, QueueStatus, QueueStore, StoreError};
use crate::reliability::{ErrorCode, RetryDecision, RetryPolicy};

/// Worker errors
///
/// Handler failures are never errors at this level; they are recorded on the
/// entry. Neither is losing a single entry to another worker. Only the store
/// failing aborts a cycle.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// The stores a worker talks to
#[derive(Clone)]
pub struct StoreHandles {
    pub queue: Arc<dyn QueueStore>,
    pub leases: Arc<dyn LeaseStore>,
}

impl StoreHandles {
    pub fn new(queue: Arc<dyn QueueStore>, leases: Arc<dyn LeaseStore>) -> Self {
        Self { queue, leases }
    }

    /// Use one store for both queue entries and leases
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: QueueStore + LeaseStore,
    {
        Self {
            queue: store.clone(),
            leases: store,
        }
    }
}

/// What happened to one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Not ready, or another worker holds the lease
    Skipped,
    Completed,
    /// Failed and scheduled for another attempt
    Retried,
    DeadLettered,
    /// The lease expired mid-handler and another worker took the entry over;
    /// our result was discarded
    LostLease,
}

/// Polls the queue and dispatches entries to their handlers
///
/// Entries within a batch are processed one at a time. Parallelism comes from
/// running several workers, coordinated only through entry leases.
pub struct SyncWorker {
    worker_id: String,
    stores: StoreHandles,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    batch_size: usize,
    poll_interval: Duration,
    lease_ttl: Duration,
    error_backoff: Duration,
    stats: WorkerStats,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncWorker {
    pub fn new(
        worker_id: impl Into<String>,
        stores: StoreHandles,
        registry: Arc<HandlerRegistry>,
        config: &QueueConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            worker_id: worker_id.into(),
            stores,
            registry,
            policy: config.retry_policy(),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval,
            lease_ttl: config.lease_ttl,
            error_backoff: config.error_backoff,
            stats: WorkerStats::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask the loop to exit after the batch in flight
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Poll and process until [`stop`](Self::stop) is called
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(&self) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Sync worker started"
        );

        loop {
            if self.is_stopped() {
                debug!("Sync loop: shutdown requested");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    if self.wait(self.poll_interval).await {
                        break;
                    }
                }
                Ok(processed) => {
                    debug!(processed, "Batch finished");
                }
                Err(e) => {
                    self.stats.record_loop_error();
                    error!(error = %e, "Poll cycle failed");
                    if self.wait(self.error_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(stats = ?self.stats.snapshot(), "Sync worker stopped");
    }

    /// Fetch one batch and process it
    ///
    /// Returns how many entries this worker won the lease for.
    pub async fn process_batch(&self) -> Result<usize, WorkerError> {
        let mut entries = self.stores.queue.get_pending(self.batch_size).await?;

        let remaining = self.batch_size.saturating_sub(entries.len());
        if remaining > 0 {
            entries.extend(self.stores.queue.get_retry_ready(remaining).await?);
        }

        if entries.is_empty() {
            return Ok(0);
        }

        debug!(count = entries.len(), "Fetched entries");

        let mut processed = 0;
        for entry in entries {
            if self.process_entry(entry.id).await? != EntryOutcome::Skipped {
                processed += 1;
            }
        }

        Ok(processed)
    }

    /// Process a single entry under a lease
    #[instrument(skip(self), fields(worker_id = %self.worker_id, entry_id = %id))]
    pub async fn process_entry(&self, id: Uuid) -> Result<EntryOutcome, WorkerError> {
        let ready = self
            .stores
            .queue
            .get_by_id(id)
            .await?
            .is_some_and(|entry| entry.is_ready(Utc::now()));
        if !ready {
            self.stats.record_skipped();
            return Ok(EntryOutcome::Skipped);
        }

        if !self
            .stores
            .leases
            .acquire(id, &self.worker_id, self.lease_ttl)
            .await?
        {
            debug!("Lease held by another worker");
            self.stats.record_skipped();
            return Ok(EntryOutcome::Skipped);
        }

        let outcome = match self.process_leased(id).await {
            Err(WorkerError::Store(e)) if e.is_entry_conflict() => {
                warn!(error = %e, "Entry taken over by another worker, result discarded");
                self.stats.record_lost_lease();
                Ok(EntryOutcome::LostLease)
            }
            other => other,
        };

        if let Err(e) = self.stores.leases.release(id, &self.worker_id).await {
            warn!(error = %e, "Failed to release lease, it will expire");
        }

        outcome
    }

    async fn process_leased(&self, id: Uuid) -> Result<EntryOutcome, WorkerError> {
        // Another worker may have finished it between the poll and our acquire
        let entry = match self.stores.queue.get_by_id(id).await? {
            Some(entry) if entry.is_claimed_by(&self.worker_id, Utc::now()) => entry,
            _ => {
                debug!("Entry no longer ready");
                self.stats.record_skipped();
                return Ok(EntryOutcome::Skipped);
            }
        };

        self.stores.queue.mark_processing(id, &self.worker_id).await?;
        self.stats.record_processed();

        debug!(
            entity_type = %entry.entity_type,
            operation = %entry.operation_type,
            attempt = entry.attempt_count + 1,
            "Dispatching entry"
        );

        let result = match self.registry.get(&entry.entity_type) {
            Some(handler) => invoke(handler, &entry).await,
            None => Err(HandlerError::new(
                ErrorCode::HandlerNotFound,
                format!("no handler registered for entity type: {}", entry.entity_type),
            )),
        };

        match result {
            Ok(outcome) => {
                self.stores
                    .queue
                    .mark_completed(id, &outcome.target_entity_id, outcome.details)
                    .await?;
                self.stats.record_succeeded();
                info!(
                    entity_type = %entry.entity_type,
                    target_entity_id = %outcome.target_entity_id,
                    "Entry synced"
                );
                Ok(EntryOutcome::Completed)
            }
            Err(err) => self.record_failure(&entry, err).await,
        }
    }

    async fn record_failure(
        &self,
        entry: &QueueEntry,
        err: HandlerError,
    ) -> Result<EntryOutcome, WorkerError> {
        let decision = self
            .policy
            .decide(entry.attempt_count, entry.max_retry_attempts, err.code);

        let failure = EntryFailure {
            error_message: err.message.clone(),
            error_code: err.code,
            should_retry: decision.should_retry(),
            retry_delay: match decision {
                RetryDecision::Retry { delay } => delay,
                RetryDecision::DeadLetter => Duration::ZERO,
            },
        };

        let status = self.stores.queue.mark_failed(entry.id, &failure).await?;

        if status == QueueStatus::FailedRetryable {
            self.stats.record_retried();
            warn!(
                entity_type = %entry.entity_type,
                attempt = entry.attempt_count + 1,
                max_attempts = entry.max_retry_attempts,
                retry_in_ms = failure.retry_delay.as_millis() as u64,
                error = %err,
                "Sync failed, will retry"
            );
            Ok(EntryOutcome::Retried)
        } else {
            self.stats.record_dead_lettered();
            error!(
                entity_type = %entry.entity_type,
                attempt = entry.attempt_count + 1,
                max_attempts = entry.max_retry_attempts,
                error = %err,
                "Sync failed, entry dead-lettered"
            );
            Ok(EntryOutcome::DeadLettered)
        }
    }

    /// Sleep for `duration`; returns `true` if shutdown was requested
    async fn wait(&self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow_and_update() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => true,
        }
    }
}

/// Run a handler, turning a panic into a permanent failure
async fn invoke(
    handler: Arc<dyn EntityHandler>,
    entry: &QueueEntry,
) -> Result<SyncOutcome, HandlerError> {
    match AssertUnwindSafe(handler.sync(&entry.payload, entry.operation_type))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(
            ErrorCode::Unknown,
            format!("handler panicked: {}", panic_message(&*panic)),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
