//! QueueStore trait definition

use async_trait::async_trait;
use uuid::Uuid;

use super::entry::{EntryFailure, NewQueueEntry, QueueDepth, QueueEntry, QueueStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entry not found
    #[error("queue entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Caller does not hold a live lease on the entry
    #[error("lease on {entry_id} is not held by {worker_id}")]
    LeaseNotHeld { entry_id: Uuid, worker_id: String },

    /// Write rejected by the entry state machine
    #[error("invalid transition for {entry_id} in status {status}")]
    InvalidTransition { entry_id: Uuid, status: QueueStatus },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// The write lost a race for one entry; the store itself is healthy
    ///
    /// Raised when a lease expired mid-handler and another worker moved the
    /// entry on. Workers drop the entry and carry on with the batch.
    pub fn is_entry_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::EntryNotFound(_)
                | StoreError::LeaseNotHeld { .. }
                | StoreError::InvalidTransition { .. }
        )
    }
}

/// Durable queue of entries awaiting synchronization
///
/// Implementations must be thread-safe and support concurrent access from
/// many workers and many processes. Every write is a single guarded state
/// transition; terminal entries reject all writes.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    // =========================================================================
    // Producer Operations
    // =========================================================================

    /// Enqueue a new entry in `PENDING`
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError>;

    // =========================================================================
    // Polling Operations
    // =========================================================================

    /// Pending entries (and processing entries orphaned by a dead worker)
    /// without a live lease, oldest first
    async fn get_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError>;

    /// Retryable entries whose `next_retry_at` has passed, oldest first
    async fn get_retry_ready(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError>;

    /// Look up a single entry
    async fn get_by_id(&self, id: Uuid) -> Result<Option<QueueEntry>, StoreError>;

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Move an entry to `PROCESSING`; the caller must hold its lease
    async fn mark_processing(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Move an entry to `COMPLETED`
    async fn mark_completed(
        &self,
        id: Uuid,
        target_entity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt
    ///
    /// Increments `attempt_count` and moves the entry to `FAILED_RETRYABLE`
    /// (with `next_retry_at`) or `DEAD_LETTERED`. Returns the new status.
    async fn mark_failed(&self, id: Uuid, failure: &EntryFailure)
        -> Result<QueueStatus, StoreError>;

    // =========================================================================
    // Dead Letter Operations
    // =========================================================================

    /// Most recently dead-lettered entries first
    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError>;

    /// Enqueue a fresh copy of a dead-lettered entry
    ///
    /// The dead-lettered original is left untouched.
    async fn requeue_dead_lettered(&self, id: Uuid) -> Result<QueueEntry, StoreError>;

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Entry counts per status
    async fn depth(&self) -> Result<QueueDepth, StoreError>;
}
