//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::classify::ErrorCode;

/// Compute the exponential backoff for a failed attempt
///
/// `base * 2^attempt_count`, capped at `max`. An `attempt_count` of 0 yields
/// the base delay.
pub fn backoff_delay(attempt_count: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Entry becomes retry-ready again after `delay`
    Retry { delay: Duration },

    /// Entry is dead-lettered
    DeadLetter,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Configuration for entry retries
///
/// Stateless: every decision is a pure function of the attempt count, the
/// entry's ceiling and the error classification.
///
/// # Example
///
/// ```
/// use reconcile_queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_base_delay(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60));
///
/// // First retry after 1 second
/// // Second retry after 2 seconds
/// // Third retry after 4 seconds
/// assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Default attempt ceiling for entries enqueued without an override
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness. The result is still capped at
    /// `max_delay`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with the queue defaults
    ///
    /// - 3 max attempts
    /// - 1 second base delay
    /// - 60 second max delay
    /// - no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Set the default maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether a failed attempt should be retried
    ///
    /// Both the attempt budget and the error classification must allow it.
    pub fn should_retry(&self, attempt_count: u32, max_attempts: u32, code: ErrorCode) -> bool {
        attempt_count < max_attempts && code.is_transient()
    }

    /// Delay before the next attempt, given attempts made before this failure
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let capped = backoff_delay(attempt_count, self.base_delay, self.max_delay);

        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }

        let secs = capped.as_secs_f64();
        let jitter_range = secs * self.jitter;
        let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
        Duration::from_secs_f64((secs + offset).max(0.0)).min(self.max_delay)
    }

    /// Decide the fate of a failed attempt
    ///
    /// `prior_attempts` is the entry's attempt count before this failure; the
    /// failure itself counts as one more attempt.
    pub fn decide(&self, prior_attempts: u32, max_attempts: u32, code: ErrorCode) -> RetryDecision {
        let attempts_made = prior_attempts.saturating_add(1);
        if self.should_retry(attempts_made, max_attempts, code) {
            RetryDecision::Retry {
                delay: self.backoff_delay(prior_attempts),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
