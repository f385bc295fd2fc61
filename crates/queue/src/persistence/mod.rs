//! Persistence layer for the sync queue
//!
//! This module provides:
//! - [`QueueStore`] trait for queue entry persistence
//! - [`InMemoryQueueStore`] for tests and single-process use
//! - [`PostgresQueueStore`] for production
//!
//! Both stores also implement [`LeaseStore`](crate::lease::LeaseStore): the
//! lease lives in the queue row itself.

mod entry;
mod memory;
mod postgres;
mod store;

pub use entry::{
    EntryFailure, Lease, NewQueueEntry, OperationType, QueueDepth, QueueEntry, QueueStatus,
    MAX_STORED_DELAY,
};
pub(crate) use entry::deadline_after;
pub use memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use store::{QueueStore, StoreError};
