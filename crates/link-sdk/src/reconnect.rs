//! Reconnect policy with linear, capped back-off.

use std::time::Duration;

/// Controls how the link retries after a failed or dropped connection.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay added per consecutive failure.
    pub step: Duration,
    /// Maximum delay between attempts (cap).
    pub max_delay: Duration,
    /// Maximum number of consecutive failed attempts before giving up.
    /// `0` means unlimited retries.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // unlimited
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        self.step.saturating_mul(failures).min(self.max_delay)
    }

    /// Whether `failures` consecutive failures exhaust the budget.
    pub fn should_give_up(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}
