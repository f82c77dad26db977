//! # Retry Policy and Backoff Strategies
//!
//! Delay schedule shared by transport reconnection and by mutation retries.
//!
//! ## Features
//!
//! - **Fixed interval**: the default for reconnection (5s)
//! - **Exponential backoff** with jitter, capped at a maximum delay
//! - **Max attempts**: once exhausted, the caller gives up
//!
//! ## Usage
//!
//! ```rust
//! use cartsync::offline::retry::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::fixed(Duration::from_secs(5), 10);
//! assert_eq!(policy.delay_for(3), Some(Duration::from_secs(5)));
//! assert_eq!(policy.delay_for(11), None);
//! ```

use rand::Rng;
use std::time::Duration;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed {
        interval: Duration,
    },
    /// Doubling delay with jitter
    Exponential {
        base: Duration,
        max: Duration,
        /// Fraction of the delay added at random (0.0 to 1.0)
        jitter: f64,
    },
}

/// Bounded retry schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    /// Attempts allowed after the first failure
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed { interval },
            max_attempts,
        }
    }

    pub fn exponential(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential {
                base,
                max,
                jitter: 0.1,
            },
            max_attempts,
        }
    }

    /// Whether attempt number `attempt` (1-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Delay before attempt number `attempt`, or `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.allows(attempt) {
            return None;
        }
        let delay = match &self.strategy {
            BackoffStrategy::Fixed { interval } => *interval,
            BackoffStrategy::Exponential { base, max, jitter } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                let delay = base.saturating_mul(factor).min(*max);
                let spread = delay.mul_f64(jitter.clamp(0.0, 1.0));
                if spread.is_zero() {
                    delay
                } else {
                    let extra = rand::thread_rng().gen_range(Duration::ZERO..=spread);
                    delay + extra
                }
            }
        };
        Some(delay)
    }
}

/// Attempt counter driven by a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts made since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count one more attempt and return its delay, or `None` when the
    /// policy is exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
