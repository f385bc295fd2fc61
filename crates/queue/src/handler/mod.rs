//! Entity handlers
//!
//! This module provides:
//! - [`EntityHandler`] - Trait for the per-entity-type synchronization logic
//! - [`HandlerError`] / [`SyncOutcome`] - Handler results
//! - [`HandlerRegistry`] - Dispatch by entity-type string

mod definition;
mod registry;

pub use definition::{EntityHandler, HandlerError, SyncOutcome};
pub use registry::{FnHandler, HandlerRegistry};
