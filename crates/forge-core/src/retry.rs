//! Retry policy for LLM request attempts.
//!
//! Retries apply to one step of one agent runner: the retry counter guards
//! consecutive retryable failures and resets on success. Backoff timers are
//! local to the runner and never block other sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum retry attempts per step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum retries per step. A step fails after `max_retries`
    /// consecutive retryable failures.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base * 2^(n-1)`.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `retry_count` (1-based).
    ///
    /// `delay = base * 2^(retry_count - 1)`, saturating on overflow.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

mod duration_ms {
    //! Serialize a `Duration` as integer milliseconds (`baseDelayMs` style).

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
