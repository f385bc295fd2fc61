//! # Entity Sync Queue Engine
//!
//! A PostgreSQL-backed work queue that synchronizes entities from an external
//! system into a local store, one queue entry at a time.
//!
//! ## Features
//!
//! - **Exclusive processing**: a time-boxed lease on each entry guarantees at
//!   most one worker processes it at any instant, across processes
//! - **Automatic retries**: transient failures back off exponentially up to a
//!   per-entry attempt ceiling
//! - **Dead-lettering**: permanent failures and exhausted budgets park the
//!   entry for operators, who can requeue it
//! - **Crash recovery**: expired leases are reaped so abandoned entries are
//!   picked up again
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerManager                          │
//! │  (starts N SyncWorkers and one LeaseReaper, stops them)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SyncWorker                            │
//! │  (poll batch, acquire lease, dispatch to EntityHandler,     │
//! │   apply RetryPolicy, record outcome, release lease)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                QueueStore + LeaseStore                      │
//! │  (PostgreSQL `sync_queue` table, or in memory for tests)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use reconcile_queue::prelude::*;
//!
//! let config = QueueConfig::from_env();
//! let store = Arc::new(PostgresQueueStore::from_config(pool, &config));
//! store.migrate().await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("product", Arc::new(ProductHandler::new(catalog)));
//!
//! let manager = WorkerManager::new(
//!     StoreHandles::shared(store),
//!     Arc::new(registry),
//!     config,
//! );
//!
//! manager.start_default();
//! tokio::signal::ctrl_c().await?;
//! manager.stop().await;
//! ```

pub mod config;
pub mod handler;
pub mod lease;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::handler::{EntityHandler, HandlerError, HandlerRegistry, SyncOutcome};
    pub use crate::lease::LeaseStore;
    pub use crate::persistence::{
        InMemoryQueueStore, NewQueueEntry, OperationType, PostgresQueueStore, QueueEntry,
        QueueStatus, QueueStore, StoreError,
    };
    pub use crate::reliability::{ErrorCode, RetryPolicy};
    pub use crate::worker::{StoreHandles, WorkerManager};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use config::QueueConfig;
pub use handler::{EntityHandler, HandlerError, HandlerRegistry, SyncOutcome};
pub use lease::{LeaseReaper, LeaseStore, MIN_REAP_INTERVAL};
pub use persistence::{
    EntryFailure, InMemoryQueueStore, NewQueueEntry, OperationType, PostgresQueueStore,
    QueueDepth, QueueEntry, QueueStatus, QueueStore, StoreError, MAX_STORED_DELAY,
};
pub use reliability::{ErrorCode, RetryDecision, RetryPolicy};
pub use worker::{
    EntryOutcome, ManagerStatus, StoreHandles, SyncWorker, WorkerError, WorkerManager,
    WorkerStatsSnapshot,
};
