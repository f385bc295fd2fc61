//! Workers that drain the queue
//!
//! ```text
//!                      WorkerManager
//!                 ┌─────────┼──────────────┐
//!                 ▼         ▼              ▼
//!           SyncWorker  SyncWorker    LeaseReaper
//!                 │         │              │
//!   poll ─► acquire ─► handler.sync ─► mark_* ─► release
//!                 │         │              │
//!                 └─────────┴──► QueueStore / LeaseStore
//! ```
//!
//! Workers share nothing but the store; the lease decides who processes an
//! entry.

mod manager;
mod stats;
mod sync_worker;

pub use manager::{ManagerStatus, WorkerManager};
pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use sync_worker::{EntryOutcome, StoreHandles, SyncWorker, WorkerError};
