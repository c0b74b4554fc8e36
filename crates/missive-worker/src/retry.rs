//! Backoff and retry budget for failed deliveries.
//!
//! The attempt counter travels inside the job envelope, so the policy is a
//! pure function of `(attempt, outcome)`. Jitter is the only source of
//! randomness.

use std::time::Duration;

use missive_core::DeliveryOutcome;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::processor::ProcessingResult;

/// How failed deliveries are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Transient failures tolerated before the job is dead-lettered.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay, hints included.
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay (0.0 to 1.0).
    pub jitter_factor: f64,

    /// How the delay grows with the attempt count.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(900),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Growth of the retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * 2^attempt`.
    #[default]
    Exponential,
    /// `base * (attempt + 1)`.
    Linear,
}

impl RetryPolicy {
    /// Decides what happens to a job after a delivery attempt.
    ///
    /// `attempt` is the number of failed attempts before this one.
    pub fn decide(&self, attempt: u32, outcome: &DeliveryOutcome) -> ProcessingResult {
        match outcome {
            DeliveryOutcome::Success => ProcessingResult::Ack,
            DeliveryOutcome::PermanentFailure { reason } => {
                ProcessingResult::DeadLetter { reason: format!("permanent failure: {reason}") }
            },
            DeliveryOutcome::TransientFailure { reason, .. } if attempt >= self.max_retries => {
                ProcessingResult::DeadLetter {
                    reason: format!(
                        "retries exhausted after {attempt} attempts ({} allowed): {reason}",
                        self.max_retries
                    ),
                }
            },
            DeliveryOutcome::TransientFailure { retry_after, .. } => ProcessingResult::Retry {
                delay: self.delay_for(attempt, *retry_after),
                next_attempt: attempt.saturating_add(1),
            },
        }
    }

    /// Delay before retrying a job that has failed `attempt` times.
    ///
    /// A provider hint raises the delay to at least the hinted value. The
    /// result never exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let jittered = apply_jitter(self.backoff(attempt), self.jitter_factor);
        let delay = match hint {
            Some(hint) => jittered.max(hint),
            None => jittered,
        };
        delay.min(self.max_delay)
    }

    /// Capped delay without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Exponential => {
                let multiplier = 2_u32.saturating_pow(attempt.min(20));
                self.base_delay.saturating_mul(multiplier)
            },
        };
        raw.min(self.max_delay)
    }
}

/// Randomizes `duration` by up to `±jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
