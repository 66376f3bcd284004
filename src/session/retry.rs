//! Reconnection retry policy
//!
//! Exponential backoff with a ceiling and a capped attempt budget. The
//! budget applies per cycle: the initial connect and each reconnect cycle
//! start counting from zero.

use std::time::Duration;

/// Policy driving connect and reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts per cycle
    pub max_attempts: u32,

    /// Delay before the second attempt (ms)
    pub backoff_initial_ms: u64,

    /// Backoff ceiling (ms)
    pub backoff_max_ms: u64,

    /// Multiplier applied per failed attempt
    pub backoff_multiplier: f64,

    /// Randomize delays by up to 50% to avoid thundering herd
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt fits the budget after `attempts_made` attempts
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Backoff before attempt `attempt + 2` (attempt is the 0-based index of
    /// the failure that triggered the wait)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.backoff_max_ms as f64);
        let ms = if self.jitter {
            capped * (0.5 + 0.5 * jitter_unit())
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }

    /// Policy that never waits and never retries, for tests and one-shot use
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_initial_ms: 0,
            backoff_max_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Cheap jitter source in [0, 1); clock-derived, no RNG dependency
fn jitter_unit() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
