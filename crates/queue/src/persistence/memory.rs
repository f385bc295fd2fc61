//! In-memory implementation of QueueStore and LeaseStore for testing

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::entry::*;
use super::store::*;
use crate::config::QueueConfig;
use crate::lease::LeaseStore;

/// In-memory implementation of QueueStore
///
/// This is primarily for testing. It stores all entries in memory and
/// provides the same semantics as the PostgreSQL implementation. Entries are
/// keyed by UUID v7, so iteration order is creation order.
///
/// # Example
///
/// ```
/// use reconcile_queue::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new().with_default_max_attempts(5);
/// ```
pub struct InMemoryQueueStore {
    entries: RwLock<BTreeMap<Uuid, QueueEntry>>,
    default_max_attempts: u32,
    available: AtomicBool,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            default_max_attempts: 3,
            available: AtomicBool::new(true),
        }
    }

    /// Create a store whose attempt ceiling comes from `config`
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new().with_default_max_attempts(config.max_retry_attempts)
    }

    /// Set the attempt ceiling for entries enqueued without an override
    pub fn with_default_max_attempts(mut self, max: u32) -> Self {
        self.default_max_attempts = max.max(1);
        self
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of every entry, oldest first
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }

    fn insert(&self, entry: NewQueueEntry, max_attempts: u32) -> QueueEntry {
        let now = Utc::now();
        let stored = QueueEntry {
            id: Uuid::now_v7(),
            entity_type: entry.entity_type,
            source_entity_id: entry.source_entity_id,
            operation_type: entry.operation_type,
            payload: entry.payload,
            status: QueueStatus::Pending,
            attempt_count: 0,
            max_retry_attempts: max_attempts.max(1),
            lease: None,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            target_entity_id: None,
            result: None,
            created_at: now,
            updated_at: now,
        };

        self.entries.write().insert(stored.id, stored.clone());
        stored
    }

    fn select(&self, limit: usize, filter: impl Fn(&QueueEntry) -> bool) -> Vec<QueueEntry> {
        self.entries
            .read()
            .values()
            .filter(|&e| filter(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Apply a transition to a non-terminal entry
    fn transition<T>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut QueueEntry, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(StoreError::EntryNotFound(id))?;

        if entry.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entry_id: id,
                status: entry.status,
            });
        }

        let now = Utc::now();
        let out = apply(&mut *entry, now)?;
        entry.updated_at = now;
        Ok(out)
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        self.check_available()?;
        let max_attempts = entry.max_retry_attempts.unwrap_or(self.default_max_attempts);
        Ok(self.insert(entry, max_attempts))
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self.select(limit, |e| {
            matches!(e.status, QueueStatus::Pending | QueueStatus::Processing)
                && !e.lease_is_live(now)
        }))
    }

    async fn get_retry_ready(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self.select(limit, |e| {
            e.status == QueueStatus::FailedRetryable && e.is_ready(now)
        }))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<QueueEntry>, StoreError> {
        self.check_available()?;
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.transition(id, |entry, now| {
            let held = entry
                .lease
                .as_ref()
                .is_some_and(|l| l.holder == worker_id && !l.is_expired(now));
            if !held {
                return Err(StoreError::LeaseNotHeld {
                    entry_id: id,
                    worker_id: worker_id.to_string(),
                });
            }

            entry.status = QueueStatus::Processing;
            entry.next_retry_at = None;
            Ok(())
        })
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        target_entity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.transition(id, |entry, _| {
            entry.status = QueueStatus::Completed;
            entry.target_entity_id = Some(target_entity_id.to_string());
            entry.result = Some(result);
            entry.next_retry_at = None;
            entry.lease = None;
            Ok(())
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        failure: &EntryFailure,
    ) -> Result<QueueStatus, StoreError> {
        self.check_available()?;
        self.transition(id, |entry, now| {
            entry.attempt_count = entry.attempt_count.saturating_add(1);
            entry.error_code = Some(failure.error_code);
            entry.error_message = Some(failure.error_message.clone());

            if failure.should_retry {
                entry.status = QueueStatus::FailedRetryable;
                entry.next_retry_at = Some(deadline_after(now, failure.retry_delay));
            } else {
                entry.status = QueueStatus::DeadLettered;
                entry.next_retry_at = None;
                entry.lease = None;
            }

            Ok(entry.status)
        })
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        self.check_available()?;
        let mut dead = self.select(usize::MAX, |e| e.status == QueueStatus::DeadLettered);
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn requeue_dead_lettered(&self, id: Uuid) -> Result<QueueEntry, StoreError> {
        self.check_available()?;
        let original = self
            .entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::EntryNotFound(id))?;

        if original.status != QueueStatus::DeadLettered {
            return Err(StoreError::InvalidTransition {
                entry_id: id,
                status: original.status,
            });
        }

        let copy = NewQueueEntry::new(
            original.entity_type,
            original.source_entity_id,
            original.operation_type,
            original.payload,
        );
        Ok(self.insert(copy, original.max_retry_attempts))
    }

    async fn depth(&self) -> Result<QueueDepth, StoreError> {
        self.check_available()?;
        let mut depth = QueueDepth::default();
        for entry in self.entries.read().values() {
            depth.record(entry.status, 1);
        }
        Ok(depth)
    }
}

#[async_trait]
impl LeaseStore for InMemoryQueueStore {
    async fn acquire(
        &self,
        entry_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&entry_id) else {
            return Ok(false);
        };

        let now = Utc::now();
        if entry.status.is_terminal() || entry.lease_is_live(now) {
            return Ok(false);
        }

        entry.lease = Some(Lease {
            holder: worker_id.to_string(),
            expires_at: deadline_after(now, ttl),
        });
        entry.updated_at = now;
        Ok(true)
    }

    async fn release(&self, entry_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&entry_id) {
            if entry.lease.as_ref().is_some_and(|l| l.holder == worker_id) {
                entry.lease = None;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn reap(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut reaped = 0;

        for entry in self.entries.write().values_mut() {
            if entry.lease.as_ref().is_some_and(|l| l.is_expired(now)) {
                entry.lease = None;
                entry.updated_at = now;
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::ErrorCode;

    fn new_entry(source_id: &str) -> NewQueueEntry {
        NewQueueEntry::new(
            "product",
            source_id,
            OperationType::Create,
            serde_json::json!({"sku": source_id}),
        )
    }

    fn failure(should_retry: bool) -> EntryFailure {
        EntryFailure {
            error_message: "upstream timed out".to_string(),
            error_code: ErrorCode::Timeout,
            should_retry,
            retry_delay: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.max_retry_attempts, 3);
        assert!(entry.lease.is_none());

        let custom = store
            .enqueue(new_entry("p-2").with_max_retry_attempts(7))
            .await
            .unwrap();
        assert_eq!(custom.max_retry_attempts, 7);
    }

    #[tokio::test]
    async fn test_get_pending_respects_limit_and_order() {
        let store = InMemoryQueueStore::new();
        let mut ids = vec![];
        for i in 0..5 {
            ids.push(store.enqueue(new_entry(&format!("p-{i}"))).await.unwrap().id);
        }

        let pending = store.get_pending(3).await.unwrap();
        let got: Vec<_> = pending.iter().map(|e| e.id).collect();
        assert_eq!(got, ids[..3].to_vec());
    }

    #[tokio::test]
    async fn test_leased_entries_are_not_polled() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        assert!(store
            .acquire(entry.id, "worker-1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(store.get_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        assert!(store
            .acquire(entry.id, "worker-1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .acquire(entry.id, "worker-2", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_acquire_missing_entry_returns_false() {
        let store = InMemoryQueueStore::new();
        assert!(!store
            .acquire(Uuid::now_v7(), "worker-1", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_oversized_durations_saturate() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        assert!(store
            .acquire(entry.id, "worker-1", Duration::MAX)
            .await
            .unwrap());
        assert!(!store
            .acquire(entry.id, "worker-2", Duration::from_secs(30))
            .await
            .unwrap());

        let leased = store.get_by_id(entry.id).await.unwrap().unwrap();
        assert!(leased.lease.unwrap().expires_at > Utc::now() + chrono::Duration::days(365));

        let status = store
            .mark_failed(
                entry.id,
                &EntryFailure {
                    retry_delay: Duration::MAX,
                    ..failure(true)
                },
            )
            .await
            .unwrap();
        assert_eq!(status, QueueStatus::FailedRetryable);
        assert!(store.get_retry_ready(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        assert!(store
            .acquire(entry.id, "worker-1", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store
            .acquire(entry.id, "worker-2", Duration::from_secs(30))
            .await
            .unwrap());

        // The original holder cannot release the new lease
        store.release(entry.id, "worker-1").await.unwrap();
        let reloaded = store.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(reloaded.lease.unwrap().holder, "worker-2");
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        store
            .acquire(entry.id, "worker-1", Duration::from_secs(30))
            .await
            .unwrap();
        store.release(entry.id, "worker-1").await.unwrap();
        store.release(entry.id, "worker-1").await.unwrap();
        store.release(Uuid::now_v7(), "worker-1").await.unwrap();

        assert!(store.get_by_id(entry.id).await.unwrap().unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_reap_only_clears_expired() {
        let store = InMemoryQueueStore::new();
        let stale = store.enqueue(new_entry("p-1")).await.unwrap();
        let live = store.enqueue(new_entry("p-2")).await.unwrap();

        store
            .acquire(stale.id, "crashed", Duration::from_millis(1))
            .await
            .unwrap();
        store
            .acquire(live.id, "worker-1", Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.reap().await.unwrap(), 1);
        assert!(store.get_by_id(stale.id).await.unwrap().unwrap().lease.is_none());
        assert!(store.get_by_id(live.id).await.unwrap().unwrap().lease.is_some());
    }

    #[tokio::test]
    async fn test_mark_processing_requires_lease() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        let result = store.mark_processing(entry.id, "worker-1").await;
        assert!(matches!(result, Err(StoreError::LeaseNotHeld { .. })));

        store
            .acquire(entry.id, "worker-1", Duration::from_secs(30))
            .await
            .unwrap();
        store.mark_processing(entry.id, "worker-1").await.unwrap();
        assert_eq!(
            store.get_by_id(entry.id).await.unwrap().unwrap().status,
            QueueStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_mark_failed_retry_then_dead_letter() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();

        let status = store.mark_failed(entry.id, &failure(true)).await.unwrap();
        assert_eq!(status, QueueStatus::FailedRetryable);

        let reloaded = store.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(reloaded.attempt_count, 1);
        assert_eq!(reloaded.error_code, Some(ErrorCode::Timeout));
        assert!(reloaded.next_retry_at.unwrap() > Utc::now());

        // Not retry-ready until the delay has passed
        assert!(store.get_retry_ready(10).await.unwrap().is_empty());

        let status = store.mark_failed(entry.id, &failure(false)).await.unwrap();
        assert_eq!(status, QueueStatus::DeadLettered);

        let reloaded = store.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(reloaded.attempt_count, 2);
        assert!(reloaded.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_terminal_entries_reject_writes() {
        let store = InMemoryQueueStore::new();
        let entry = store.enqueue(new_entry("p-1")).await.unwrap();
        store
            .mark_completed(entry.id, "local-1", serde_json::json!({}))
            .await
            .unwrap();

        let result = store.mark_failed(entry.id, &failure(true)).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
        assert!(!store
            .acquire(entry.id, "worker-1", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_requeue_dead_lettered() {
        let store = InMemoryQueueStore::new();
        let entry = store
            .enqueue(new_entry("p-1").with_max_retry_attempts(5))
            .await
            .unwrap();

        let result = store.requeue_dead_lettered(entry.id).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));

        store.mark_failed(entry.id, &failure(false)).await.unwrap();
        assert_eq!(store.list_dead_lettered(10).await.unwrap().len(), 1);

        let copy = store.requeue_dead_lettered(entry.id).await.unwrap();
        assert_ne!(copy.id, entry.id);
        assert_eq!(copy.status, QueueStatus::Pending);
        assert_eq!(copy.max_retry_attempts, 5);
        assert_eq!(copy.payload, entry.payload);

        let original = store.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(original.status, QueueStatus::DeadLettered);
    }

    #[tokio::test]
    async fn test_depth() {
        let store = InMemoryQueueStore::new();
        let a = store.enqueue(new_entry("p-1")).await.unwrap();
        store.enqueue(new_entry("p-2")).await.unwrap();
        store
            .mark_completed(a.id, "local-1", serde_json::json!({}))
            .await
            .unwrap();

        let depth = store.depth().await.unwrap();
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.completed, 1);
        assert_eq!(depth.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryQueueStore::new();
        store.set_available(false);

        assert!(matches!(
            store.get_pending(10).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.get_pending(10).await.is_ok());
    }
}
