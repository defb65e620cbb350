//! Backoff policy with configurable growth and jitter.
//!
//! Used by egress rotation and between download retry rounds.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

const fn default_max_attempts() -> usize {
    5
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy with no delay at all, for tests and dry runs.
    #[must_use]
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Delay before retry number `attempt` (0-indexed), before jitter.
    #[must_use]
    pub fn base_delay_for(&self, attempt: usize) -> u64 {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);

        match self.backoff_strategy {
            BackoffStrategy::Exponential => base
                .saturating_mul(2u64.saturating_pow(attempt))
                .min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        }
    }

    /// Delay before retry number `attempt` (0-indexed), jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }

    /// Returns true once `attempts` attempts have been used.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: usize) -> bool {
        attempts >= self.max_attempts
    }
}
