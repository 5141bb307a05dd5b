//! # Retry Policy
//!
//! Fixed or exponential backoff with a cap and optional jitter. Counts are failed
//! attempts charged to the execution, so with `max_retries = 3` the third transient
//! failure dead-letters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Fraction of the delay, 0.0 to 1.0
    pub max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: false,
            max_jitter: 0.0,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            ..Self::exponential(max_retries, delay, delay)
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, max_jitter: f64) -> Self {
        self.jitter = max_jitter > 0.0;
        self.max_jitter = max_jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let base_delay = Duration::from_millis(config.base_delay_ms);
        let max_delay = Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms));
        let mut policy = if config.fixed {
            Self::fixed(config.max_retries, base_delay)
        } else {
            Self::exponential(config.max_retries, base_delay, max_delay)
                .with_multiplier(config.multiplier)
        };
        if config.jitter {
            policy = policy.with_jitter(config.max_jitter);
        }
        policy
    }

    /// Whether an execution with `retry_count` charged failures may run again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt after the `retry_count`-th failure (1-based).
    pub fn get_delay(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        if !self.jitter {
            return delay;
        }
        apply_jitter(delay, self.max_jitter).min(self.max_delay)
    }

    fn base_delay_for(&self, retry_count: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exponent = retry_count.saturating_sub(1).min(64) as i32;
                let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
                let capped = nanos.min(self.max_delay.as_nanos() as f64);
                if capped.is_finite() && capped >= 0.0 {
                    Duration::from_nanos(capped as u64).min(self.max_delay)
                } else {
                    self.max_delay
                }
            }
        }
    }
}

/// Spread `delay` by up to `max_jitter` of itself in either direction.
fn apply_jitter(delay: Duration, max_jitter: f64) -> Duration {
    use rand::Rng;

    let range = delay.as_secs_f64() * max_jitter;
    if range <= 0.0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let offset = rng.gen_range(-range..=range);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
