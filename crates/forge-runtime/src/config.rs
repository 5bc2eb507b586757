//! Runner configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use forge_core::retry::RetryPolicy;

/// Default step budget per turn.
pub const DEFAULT_MAX_STEPS: u32 = 20;

/// Default chunk watchdog deadline.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Failsafe wait for a stopped runner to reach its done state.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Tunable limits for one agent runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Maximum LLM requests per turn (retries of one step do not count).
    pub max_steps: u32,
    /// Watchdog deadline between streamed chunks; firing aborts the
    /// attempt as retryable.
    #[serde(with = "duration_ms")]
    pub chunk_timeout: Duration,
    /// Backoff policy for retryable request failures.
    pub retry: RetryPolicy,
    /// How long the controller waits for a stopped runner before giving up.
    #[serde(with = "duration_ms")]
    pub stop_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            retry: RetryPolicy::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

mod duration_ms {
    //! Serialize a `Duration` as integer milliseconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
