//! Generic retry driver with exponential backoff and jitter
//!
//! Reusable over any fallible async operation; the lock cycle is driven
//! through this, but nothing here knows about locks. Backoff sleeps use
//! tokio timers, so dropping the returned future mid-wait cancels the
//! remaining attempts cleanly.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Minimum wait between attempts after jitter is applied
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Retry behaviour knobs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Base delay between attempts
    pub delay: Duration,
    /// Double the delay on each retry when true
    pub exponential_backoff: bool,
    /// Cap applied to the exponential delay
    pub max_delay: Duration,
    /// Multiply the wait by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
            exponential_backoff: true,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Result of a retry run, immutable once returned
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub succeeded: bool,
    /// Total attempts made, >= 1
    pub attempts_made: u32,
    /// One description per failed attempt, in attempt order
    pub errors: Vec<String>,
}

impl std::fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.succeeded {
            write!(f, "success after {} attempt(s)", self.attempts_made)
        } else {
            write!(
                f,
                "failed after {} attempt(s): {}",
                self.attempts_made,
                self.errors.last().map(String::as_str).unwrap_or("no error recorded")
            )
        }
    }
}

/// Compute the wait before retry `k` (k = 1 for the first retry)
fn backoff_interval(policy: &RetryPolicy, retry_num: u32) -> Duration {
    let base = if policy.exponential_backoff {
        let factor = 2u32.saturating_pow(retry_num.saturating_sub(1));
        policy.delay.saturating_mul(factor).min(policy.max_delay)
    } else {
        policy.delay
    };

    let jittered = if policy.jitter {
        base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    } else {
        base
    };

    jittered.max(MIN_BACKOFF)
}

/// Run `operation` until it succeeds or the retry budget is exhausted
///
/// Every failure is caught and recorded; the operation's error never
/// propagates out of this function.
pub async fn execute_with_retry<F, Fut, E>(mut operation: F, policy: &RetryPolicy) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut errors = Vec::new();

    for attempt in 0..=policy.max_retries {
        match operation().await {
            Ok(()) => {
                if attempt > 0 {
                    info!(attempts = %(attempt + 1), "retry_succeeded");
                }
                return RetryOutcome { succeeded: true, attempts_made: attempt + 1, errors };
            }
            Err(e) => {
                errors.push(e.to_string());
                if attempt == policy.max_retries {
                    error!(attempts = %(attempt + 1), error = %e, "retry_exhausted");
                    break;
                }

                let wait = backoff_interval(policy, attempt + 1);
                warn!(
                    attempt = %(attempt + 1),
                    max_attempts = %(policy.max_retries + 1),
                    wait_ms = %wait.as_millis(),
                    error = %e,
                    "retry_attempt_failed"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    RetryOutcome { succeeded: false, attempts_made: policy.max_retries + 1, errors }
}
