//! Connect Retry Backoff
//!
//! Delay between failed connect attempts. `attempt` is the number of
//! attempts that have already failed (starting at 1).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Delay policy between connect attempts
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay after every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `initial * multiplier^(attempt-1)` capped at `max`, with optional full jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(scaled as u64)
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = ceiling.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Serializable backoff selection for `RemoteConfig`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Fixed { delay_ms: 2000 }
    }
}

impl RetryBackoff {
    pub fn build(&self) -> Arc<dyn BackoffPolicy> {
        match *self {
            RetryBackoff::Fixed { delay_ms } => Arc::new(FixedBackoff::new(Duration::from_millis(delay_ms))),
            RetryBackoff::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
            } => Arc::new(
                ExponentialBackoff::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
                    .with_multiplier(multiplier)
                    .with_jitter(jitter),
            ),
        }
    }
}
