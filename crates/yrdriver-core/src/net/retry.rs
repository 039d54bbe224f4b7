//! Reconnect policy for duplex channels.
//!
//! Channels reconnect with a fixed delay by default. Exponential backoff and
//! jitter remain available for peers that take longer to come up.

use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base; `1.0` keeps the delay fixed.
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryConfig {
    /// Fixed-delay policy with the given attempt budget.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Switch to exponential backoff starting at the current base delay.
    pub fn with_backoff(mut self, exponential_base: f64, max_delay: Duration) -> Self {
        self.exponential_base = exponential_base;
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay after a failed attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean delay while spreading reconnects.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}
