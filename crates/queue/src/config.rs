//! Queue processing configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::lease::MIN_REAP_INTERVAL;
use crate::reliability::{duration_millis, RetryPolicy};

/// Configuration shared by the workers of one [`WorkerManager`](crate::worker::WorkerManager)
///
/// All durations are serialized as milliseconds. Missing fields fall back to
/// the defaults below.
///
/// | option               | default  | env var                            |
/// |----------------------|----------|------------------------------------|
/// | `batch_size`         | 100      | `SYNC_QUEUE_BATCH_SIZE`            |
/// | `poll_interval`      | 1 s      | `SYNC_QUEUE_POLL_INTERVAL_MS`      |
/// | `lease_ttl`          | 300 s    | `SYNC_QUEUE_LEASE_TTL_SECS`        |
/// | `max_retry_attempts` | 3        | `SYNC_QUEUE_MAX_RETRY_ATTEMPTS`    |
/// | `retry_backoff_base` | 1 s      | `SYNC_QUEUE_RETRY_BACKOFF_BASE_MS` |
/// | `retry_backoff_max`  | 60 s     | `SYNC_QUEUE_RETRY_BACKOFF_MAX_MS`  |
/// | `worker_count`       | 2        | `SYNC_QUEUE_WORKER_COUNT`          |
/// | `error_backoff`      | 5 s      | `SYNC_QUEUE_ERROR_BACKOFF_MS`      |
/// | `reap_interval`      | 60 s     | `SYNC_QUEUE_REAP_INTERVAL_SECS`    |
/// | `worker_id_prefix`   | generated| `SYNC_QUEUE_WORKER_ID_PREFIX`      |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum entries fetched per poll
    pub batch_size: usize,

    /// Sleep between polls when the queue is empty
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// How long a lease protects an entry; must exceed the slowest handler
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// Attempt ceiling for entries enqueued without an override
    ///
    /// Stored on each entry at enqueue time, so it reaches the engine through
    /// the store: build it with
    /// [`InMemoryQueueStore::from_config`](crate::InMemoryQueueStore::from_config) or
    /// [`PostgresQueueStore::from_config`](crate::PostgresQueueStore::from_config).
    pub max_retry_attempts: u32,

    #[serde(with = "duration_millis")]
    pub retry_backoff_base: Duration,

    #[serde(with = "duration_millis")]
    pub retry_backoff_max: Duration,

    /// Workers started by [`WorkerManager::start_default`](crate::worker::WorkerManager::start_default)
    pub worker_count: usize,

    /// Sleep after a failed poll cycle
    #[serde(with = "duration_millis")]
    pub error_backoff: Duration,

    /// How often expired leases are cleared
    #[serde(with = "duration_millis")]
    pub reap_interval: Duration,

    /// Worker ids are `{prefix}-{index}`
    pub worker_id_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_secs(300),
            max_retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_millis(60_000),
            worker_count: 2,
            error_backoff: Duration::from_millis(5000),
            reap_interval: Duration::from_secs(60),
            worker_id_prefix: format!("sync-worker-{}", Uuid::now_v7()),
        }
    }
}

impl QueueConfig {
    /// Create configuration from `SYNC_QUEUE_*` environment variables
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| -> Option<u64> { parse_var(name, lookup(name)) };

        let mut config = Self::default();

        if let Some(v) = parse("SYNC_QUEUE_BATCH_SIZE") {
            config = config.with_batch_size(v as usize);
        }
        if let Some(v) = parse("SYNC_QUEUE_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse("SYNC_QUEUE_LEASE_TTL_SECS") {
            config.lease_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse("SYNC_QUEUE_MAX_RETRY_ATTEMPTS") {
            config = config.with_max_retry_attempts(u32::try_from(v).unwrap_or(u32::MAX));
        }
        if let Some(v) = parse("SYNC_QUEUE_RETRY_BACKOFF_BASE_MS") {
            config.retry_backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = parse("SYNC_QUEUE_RETRY_BACKOFF_MAX_MS") {
            config.retry_backoff_max = Duration::from_millis(v);
        }
        if let Some(v) = parse("SYNC_QUEUE_WORKER_COUNT") {
            config.worker_count = v as usize;
        }
        if let Some(v) = parse("SYNC_QUEUE_ERROR_BACKOFF_MS") {
            config.error_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse("SYNC_QUEUE_REAP_INTERVAL_SECS") {
            config = config.with_reap_interval(Duration::from_secs(v));
        }
        if let Some(prefix) = lookup("SYNC_QUEUE_WORKER_ID_PREFIX").filter(|p| !p.is_empty()) {
            config.worker_id_prefix = prefix;
        }

        config
    }

    /// Set the batch size (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the default attempt ceiling (at least 1)
    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the reap interval (at least [`MIN_REAP_INTERVAL`])
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval.max(MIN_REAP_INTERVAL);
        self
    }

    pub fn with_worker_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_id_prefix = prefix.into();
        self
    }

    /// Retry policy derived from the backoff settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_attempts(self.max_retry_attempts.max(1))
            .with_base_delay(self.retry_backoff_base)
            .with_max_delay(self.retry_backoff_max)
    }

    /// Id of the worker at `index`
    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-{}", self.worker_id_prefix, index)
    }
}

fn parse_var<T: FromStr>(name: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(var = name, value = %value, "Ignoring unparsable configuration value");
            None
        }
    }
}
