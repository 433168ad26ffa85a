//! Reconnect backoff policy
//!
//! Exponential backoff for the connection supervisor's retry loop. Unlike a
//! bounded retry policy there is no attempt limit: the supervisor keeps
//! retrying until the connection is closed on purpose.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between connect attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt, in milliseconds
    pub initial_backoff_ms: u64,

    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay, in milliseconds
    pub max_backoff_ms: u64,

    /// Whether to scale each delay by a random factor in 0.5..=1.5
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy with the given initial delay and defaults elsewhere
    ///
    /// # Example
    ///
    /// ```rust
    /// use rta::backoff::BackoffPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = BackoffPolicy::new(Duration::from_millis(100));
    /// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
    /// ```
    pub fn new(initial: Duration) -> Self {
        Self {
            initial_backoff_ms: initial.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Set the multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the maximum delay
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Initial delay
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Maximum delay
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay following `current`: `current * multiplier`, capped at the maximum
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.backoff_multiplier;
        let capped = next.min(self.max().as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Delay before retry number `attempt` (0-indexed), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial().min(self.max());
        for _ in 0..attempt {
            delay = self.next_delay(delay);
            if delay >= self.max() {
                break;
            }
        }
        delay
    }

    /// Apply jitter to a scheduled delay if enabled
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Iterator over the delays of one retry episode
    pub fn schedule(&self) -> BackoffSchedule<'_> {
        BackoffSchedule {
            policy: self,
            current: self.initial().min(self.max()),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            backoff_multiplier: 3.0,
            max_backoff_ms: 60_000,
            jitter: false,
        }
    }
}

/// Endless iterator of backoff delays for one connect episode
#[derive(Debug, Clone)]
pub struct BackoffSchedule<'a> {
    policy: &'a BackoffPolicy,
    current: Duration,
}

impl Iterator for BackoffSchedule<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = self.policy.next_delay(delay);
        Some(self.policy.jittered(delay))
    }
}
