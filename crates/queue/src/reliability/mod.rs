//! Reliability patterns for queue processing
//!
//! This module provides:
//! - [`RetryPolicy`] - Retry budget and exponential backoff
//! - [`ErrorCode`] - Transient vs. permanent failure classification

mod classify;
mod retry;

pub use classify::{is_transient, ErrorCode};
pub use retry::{backoff_delay, RetryDecision, RetryPolicy};

pub(crate) use retry::duration_millis;
