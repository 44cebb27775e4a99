//! Bounded retry with exponential backoff
//!
//! Only [`SyncError::Connection`] failures are retried. Any other failure ends
//! the operation on the attempt that raised it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::scheduler::CancelSignal;

/// Retry parameters for one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, in `0.0..=1.0`
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately; handy where waiting adds nothing
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    ///
    /// `base_delay * multiplier^(attempt-1) * (1 ± jitter)`, capped at `max_delay`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nominal = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        let secs = (nominal * factor).clamp(0.0, self.max_delay.as_secs_f64());
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

/// Result of running an operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, SyncError>,
    pub attempts: u32,
    /// Wall time of each attempt, excluding backoff
    pub attempt_durations: Vec<Duration>,
    /// Wall time from first attempt to final result, including backoff
    pub duration: Duration,
}

/// Run `operation` until it succeeds, fails fatally or runs out of attempts
///
/// The operation receives the 1-based attempt number. Exhausting attempts
/// yields [`SyncError::RetryExhausted`] wrapping the last failure.
/// Cancellation is honoured between attempts only; an attempt in progress
/// always runs to completion.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_durations = Vec::new();
    let mut attempt = 0;

    let result = loop {
        attempt += 1;

        let attempt_started = Instant::now();
        let outcome = operation(attempt).await;
        attempt_durations.push(attempt_started.elapsed());

        let err = match outcome {
            Ok(value) => break Ok(value),
            Err(err) if !err.is_retryable() => break Err(err),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            warn!("Giving up after {} attempts: {}", attempt, err);
            break Err(SyncError::RetryExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_for(attempt, &mut rand::thread_rng());
        debug!(
            "Attempt {}/{} failed ({}), retrying in {:.2}s",
            attempt,
            max_attempts,
            err,
            delay.as_secs_f64()
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(SyncError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    Attempted {
        result,
        attempts: attempt,
        attempt_durations,
        duration: started.elapsed(),
    }
}
