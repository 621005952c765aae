//! Exponential backoff between attempts of a failing job

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

mod defaults {
    pub const fn max_attempts() -> u32 {
        5
    }

    pub const fn base_retry_delay_secs() -> u64 {
        30
    }

    pub const fn max_retry_delay_secs() -> u64 {
        3600
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}

/// How often, and how far apart, a failing job is attempted before it is
/// dead-lettered
///
/// The delay after the `n`th failure is `base * 2^(n-1)`, capped at
/// `max_retry_delay_secs` and then spread by `±retry_jitter_factor` so that a
/// burst of failures does not come back as a burst of retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures after which a job goes to the dead letter queue
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failure, in seconds
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Ceiling on any single delay, in seconds
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Fraction of the delay added or removed at random, `0.0` to disable
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// `true` once a job has failed as many times as the policy allows
    #[must_use]
    pub const fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Un-jittered delay after the given number of failures
    #[must_use]
    pub fn nominal_backoff(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1);
        let secs = 2u64
            .checked_pow(doublings)
            .map_or(self.max_retry_delay_secs, |factor| {
                self.base_retry_delay_secs.saturating_mul(factor)
            })
            .min(self.max_retry_delay_secs);

        Duration::from_secs(secs)
    }

    /// Delay to wait after the given number of failures, jitter applied
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let nominal = self.nominal_backoff(failures);
        if nominal.is_zero() || self.retry_jitter_factor <= 0.0 {
            return nominal;
        }

        let spread = nominal.as_secs_f64() * self.retry_jitter_factor;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((nominal.as_secs_f64() + offset).max(0.0))
    }
}
