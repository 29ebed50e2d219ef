//! Retry backoff for queued tasks
//!
//! The queue does not loop inside a single call the way an in-process retry
//! helper would; it persists `next_attempt_at` and lets the drain loop pick
//! the task up again. This module only answers "how long until the next
//! attempt" and "may it be retried at all".

use crate::config::QueueConfig;
use cairn_core::CairnError;
use rand::Rng;
use std::time::Duration;

/// Shape of the delay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `initial * 2^attempt`
    Exponential,
    /// Exponential plus up to 10% random extra to spread retries apart
    ExponentialWithJitter,
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0 = first retry), capped at `max_delay`
    pub fn calculate_delay(
        &self,
        attempt: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        let delay = match self {
            BackoffStrategy::Exponential => {
                initial_delay.saturating_mul(2u32.saturating_pow(attempt))
            }
            BackoffStrategy::ExponentialWithJitter => {
                let base_delay = initial_delay.saturating_mul(2u32.saturating_pow(attempt));
                let jitter =
                    (base_delay.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
                base_delay.saturating_add(Duration::from_millis(jitter))
            }
        };

        delay.min(max_delay)
    }
}

/// Retry decisions for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
    /// Delay curve
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    /// Exponential policy with the given bounds
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.strategy = if enable {
            BackoffStrategy::ExponentialWithJitter
        } else {
            BackoffStrategy::Exponential
        };
        self
    }

    /// Policy described by the queue section of the configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::exponential(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
        .with_jitter(config.jitter)
    }

    /// Delay after `attempts_made` failed attempts
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        self.strategy.calculate_delay(
            attempts_made.saturating_sub(1),
            self.initial_delay,
            self.max_delay,
        )
    }

    /// Whether a task that has failed `attempts_made` times with `error`
    /// should be scheduled again
    pub fn should_retry(&self, attempts_made: u32, error: &CairnError) -> bool {
        error.is_transient() && attempts_made < self.max_attempts
    }
}
