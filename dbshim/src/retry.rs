//! Reconnect-and-replay policy.
//!
//! The replay loop itself lives in the MySQL backend; this module only
//! carries the bounds and draws the jittered sleep between attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Bounds for the reconnect-and-replay cycle on transient connection loss.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Replay cycles (sleep + reconnect + replay) before giving up.
    pub max_replays: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_replays: 5,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(12),
        }
    }
}

impl RetryPolicy {
    /// Draws a uniformly jittered delay in `[min_delay, max_delay]`.
    pub fn delay(&self) -> Duration {
        if self.min_delay >= self.max_delay {
            return self.min_delay;
        }
        let ms = rand::thread_rng()
            .gen_range(self.min_delay.as_millis()..=self.max_delay.as_millis());
        Duration::from_millis(ms as u64)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_replays: config.max_replays,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}
