//! Retry policies for step attempts.
//!
//! A policy only decides; the orchestrator owns the sleep between attempts.

use std::time::Duration;

use crate::error::StepError;

/// Outcome of consulting a [`RetryPolicy`] after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt after the given delay.
    Retry(Duration),
    /// Stop retrying.
    GiveUp,
}

/// How a failed step attempt is retried.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RetryPolicy {
    /// A single attempt.
    #[default]
    NoRetry,

    /// Fixed delay between attempts.
    Simple { max_attempts: u32, delay: Duration },

    /// Delay doubling after every attempt, capped at `max_delay`.
    ///
    /// With `jitter`, the actual delay is drawn uniformly from
    /// `[delay / 2, delay]`.
    ExponentialBackoff {
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        jitter: bool,
    },
}

impl RetryPolicy {
    pub fn simple(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy::Simple {
            max_attempts,
            delay,
        }
    }

    /// Exponential backoff without jitter.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_attempts,
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Turns on jitter for an exponential policy. Other policies are unchanged.
    pub fn with_jitter(self) -> Self {
        match self {
            RetryPolicy::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                ..
            } => RetryPolicy::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                jitter: true,
            },
            other => other,
        }
    }

    /// Total number of attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::NoRetry => 1,
            RetryPolicy::Simple { max_attempts, .. }
            | RetryPolicy::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }

    /// Checks the policy parameters.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RetryPolicy::NoRetry => Ok(()),
            RetryPolicy::Simple { max_attempts, .. } if *max_attempts == 0 => {
                Err("max_attempts must be at least 1".to_string())
            }
            RetryPolicy::Simple { .. } => Ok(()),
            RetryPolicy::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                ..
            } => {
                if *max_attempts == 0 {
                    Err("max_attempts must be at least 1".to_string())
                } else if initial_delay.is_zero() {
                    Err("initial_delay must be greater than zero".to_string())
                } else if initial_delay > max_delay {
                    Err(format!(
                        "initial_delay {initial_delay:?} exceeds max_delay {max_delay:?}"
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Base delay after failed attempt `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::NoRetry => Duration::ZERO,
            RetryPolicy::Simple { delay, .. } => *delay,
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                ..
            } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial_delay.saturating_mul(factor).min(*max_delay)
            }
        }
    }

    /// Decides what happens after attempt `attempt` failed with `error`.
    pub fn decide(&self, attempt: u32, error: &StepError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts() {
            return RetryDecision::GiveUp;
        }

        let delay = self.base_delay(attempt);
        match self {
            RetryPolicy::ExponentialBackoff { jitter: true, .. } => {
                RetryDecision::Retry(jittered(delay, rand::random::<f64>()))
            }
            _ => RetryDecision::Retry(delay),
        }
    }
}

/// Maps `sample` in `[0, 1)` onto `[delay / 2, delay]`.
fn jittered(delay: Duration, sample: f64) -> Duration {
    let low = delay / 2;
    low + (delay - low).mul_f64(sample.clamp(0.0, 1.0))
}
