//! Lease-based exclusive ownership of queue entries
//!
//! A lease is a time-boxed ownership marker stored on the queue row. Workers
//! never block on each other: a worker that loses the race for an entry
//! simply skips it this cycle, and a lease abandoned by a crashed worker is
//! cleared by the [`LeaseReaper`].
//!
//! ```text
//!   acquire(entry, worker-a, ttl) ──► true    locked_by = worker-a
//!   acquire(entry, worker-b, ttl) ──► false   (skip this cycle)
//!           ... ttl elapses, worker-a crashed ...
//!   reap()                        ──► 1       locked_by = NULL
//!   acquire(entry, worker-b, ttl) ──► true
//! ```

mod reaper;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::persistence::StoreError;

pub use reaper::{LeaseReaper, MIN_REAP_INTERVAL};

/// Storage for entry leases
///
/// Contention is reported through return values, never as an error. Errors
/// are reserved for the store itself failing.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Take the lease if the entry is unlocked or its lease expired
    ///
    /// Returns `false` when another worker holds a live lease, when the entry
    /// is terminal, or when it does not exist.
    async fn acquire(&self, entry_id: Uuid, worker_id: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Clear the lease if `worker_id` holds it; otherwise a no-op
    async fn release(&self, entry_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Clear every expired lease, returning how many were cleared
    async fn reap(&self) -> Result<u64, StoreError>;
}
