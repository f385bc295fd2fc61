//! Queue entry model

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::StoreError;
use crate::reliability::ErrorCode;

/// Entry status in the queue
///
/// ```text
/// PENDING ──► PROCESSING ──► COMPLETED
///                 │
///                 ├──► FAILED_RETRYABLE ──► PROCESSING ...
///                 │
///                 └──► DEAD_LETTERED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    FailedRetryable,
    DeadLettered,
}

impl QueueStatus {
    /// Completed and dead-lettered entries never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::FailedRetryable => "FAILED_RETRYABLE",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED_RETRYABLE" => Ok(Self::FailedRetryable),
            "DEAD_LETTERED" => Ok(Self::DeadLettered),
            other => Err(StoreError::Serialization(format!(
                "unknown queue status: {}",
                other
            ))),
        }
    }
}

/// Logical operation the handler should perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(StoreError::Serialization(format!(
                "unknown operation type: {}",
                other
            ))),
        }
    }
}

/// Longest lease or retry delay a store records (100 years)
///
/// Longer durations are clamped to this rather than rejected.
pub const MAX_STORED_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + delay`, saturating at [`MAX_STORED_DELAY`]
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay.min(MAX_STORED_DELAY))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time-boxed ownership of an entry
///
/// Stored as the `locked_by` / `lock_expires_at` column pair; both are set
/// or both are null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Rebuild a lease from its nullable column pair
    pub fn from_columns(
        locked_by: Option<String>,
        lock_expires_at: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        match (locked_by, lock_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Self { holder, expires_at }),
            _ => None,
        }
    }
}

/// The unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub source_entity_id: String,
    pub operation_type: OperationType,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub attempt_count: u32,
    pub max_retry_attempts: u32,
    pub lease: Option<Lease>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub target_entity_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Whether someone holds an unexpired lease on this entry
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Whether a worker may pick this entry up right now
    ///
    /// Pending entries, retry-ready entries, and processing entries whose
    /// worker vanished (lease gone or expired) are ready, provided nobody
    /// holds a live lease on them.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.lease_is_live(now) && self.is_due(now)
    }

    /// Whether `worker_id` holds a live lease and the entry still needs work
    pub fn is_claimed_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        let held = self
            .lease
            .as_ref()
            .is_some_and(|l| l.holder == worker_id && !l.is_expired(now));
        held && self.is_due(now)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending | QueueStatus::Processing => true,
            QueueStatus::FailedRetryable => self.next_retry_at.map_or(true, |at| at <= now),
            QueueStatus::Completed | QueueStatus::DeadLettered => false,
        }
    }
}

/// Definition of an entry to be enqueued
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub entity_type: String,
    pub source_entity_id: String,
    pub operation_type: OperationType,
    pub payload: serde_json::Value,

    /// Overrides the store's default attempt ceiling
    pub max_retry_attempts: Option<u32>,
}

impl NewQueueEntry {
    pub fn new(
        entity_type: impl Into<String>,
        source_entity_id: impl Into<String>,
        operation_type: OperationType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            source_entity_id: source_entity_id.into(),
            operation_type,
            payload,
            max_retry_attempts: None,
        }
    }

    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = Some(max);
        self
    }
}

/// Failure report for [`QueueStore::mark_failed`](super::QueueStore::mark_failed)
#[derive(Debug, Clone)]
pub struct EntryFailure {
    pub error_message: String,
    pub error_code: ErrorCode,

    /// Retry (`FAILED_RETRYABLE`) or give up (`DEAD_LETTERED`)
    pub should_retry: bool,

    /// Delay until the entry becomes retry-ready; ignored when not retrying
    pub retry_delay: Duration,
}

/// Entry counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed_retryable: u64,
    pub dead_lettered: u64,
}

impl QueueDepth {
    pub fn record(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::FailedRetryable => self.failed_retryable += count,
            QueueStatus::DeadLettered => self.dead_lettered += count,
        }
    }

    /// Entries that still need work
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing + self.failed_retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(status: QueueStatus) -> QueueEntry {
        let now = Utc::now();
        QueueEntry {
            id: Uuid::now_v7(),
            entity_type: "product".to_string(),
            source_entity_id: "src-1".to_string(),
            operation_type: OperationType::Create,
            payload: serde_json::json!({}),
            status,
            attempt_count: 0,
            max_retry_attempts: 3,
            lease: None,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            target_entity_id: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::FailedRetryable,
            QueueStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::DeadLettered.is_terminal());
        assert!(!QueueStatus::FailedRetryable.is_terminal());
    }

    #[test]
    fn test_lease_from_columns_is_all_or_nothing() {
        assert!(Lease::from_columns(Some("w".into()), None).is_none());
        assert!(Lease::from_columns(None, Some(Utc::now())).is_none());
        assert!(Lease::from_columns(Some("w".into()), Some(Utc::now())).is_some());
    }

    #[test]
    fn test_readiness() {
        let now = Utc::now();

        assert!(entry(QueueStatus::Pending).is_ready(now));
        assert!(!entry(QueueStatus::Completed).is_ready(now));

        let mut waiting = entry(QueueStatus::FailedRetryable);
        waiting.next_retry_at = Some(now + ChronoDuration::seconds(30));
        assert!(!waiting.is_ready(now));
        waiting.next_retry_at = Some(now - ChronoDuration::seconds(1));
        assert!(waiting.is_ready(now));

        let mut leased = entry(QueueStatus::Processing);
        leased.lease = Some(Lease {
            holder: "worker-1".into(),
            expires_at: now + ChronoDuration::seconds(30),
        });
        assert!(!leased.is_ready(now));
        assert!(leased.is_claimed_by("worker-1", now));
        assert!(!leased.is_claimed_by("worker-2", now));

        // Orphaned by a crashed worker
        leased.lease = Some(Lease {
            holder: "worker-1".into(),
            expires_at: now - ChronoDuration::seconds(1),
        });
        assert!(leased.is_ready(now));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Utc::now();

        assert_eq!(
            deadline_after(now, Duration::from_secs(30)),
            now + ChronoDuration::seconds(30)
        );

        let far = deadline_after(now, Duration::MAX);
        assert_eq!(far, deadline_after(now, MAX_STORED_DELAY));
        assert!(far > now + ChronoDuration::days(365 * 99));
    }
}
