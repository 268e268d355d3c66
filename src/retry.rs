//! Bounded retry with exponential backoff and jitter.
//!
//! Used by the concept linker for reference lookups and by the artifact store
//! for backend writes. The policy is a plain value and the clock is injected
//! through [`Sleeper`], so tests can assert the exact delay schedule without
//! waiting for it.
//!
//! ```text
//! attempt 1 ──fail──▶ sleep base ──▶ attempt 2 ──fail──▶ sleep 2·base ──▶ …
//!                                                   (capped at max_delay)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: attempt ceiling, backoff shape and per-attempt deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always ≥ 1.
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds. Doubles afterwards.
    pub base_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplicative jitter in `[0, 1]`. A delay `d` becomes a uniform
    /// sample from `[d·(1-jitter), d]`. `0.0` makes the schedule exact.
    pub jitter: f64,

    /// Deadline for one attempt, in milliseconds.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            jitter: 0.2,
            attempt_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delays between attempts. Handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
            attempt_timeout_ms: 10_000,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Backoff before retry number `retry` (1 = delay after first failure),
    /// without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Backoff with jitter applied and a server hint folded in.
    ///
    /// A hint (e.g. `Retry-After`) raises the delay but never above
    /// `max_delay_ms`.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let base = self.backoff(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 {
            let factor = 1.0 - jitter * rand::random::<f64>();
            base.mul_f64(factor)
        } else {
            base
        };
        let cap = Duration::from_millis(self.max_delay_ms);
        match hint {
            Some(h) => jittered.max(h).min(cap),
            None => jittered,
        }
    }
}

/// Sleep abstraction so tests can run the retry loop on a fake clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// How the loop should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again, optionally no sooner than the given delay.
    Retry(Option<Duration>),
    /// Give up immediately.
    GiveUp,
}

/// Outcome of [`run`]: the final result and how many attempts were made.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` under `policy`, classifying each error with `classify`.
///
/// Stops at the first success, the first `GiveUp`, or after
/// `policy.max_attempts` attempts. Never loops unbounded.
pub async fn run<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
    classify: C,
) -> Attempted<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDecision,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) => {
                let hint = match classify(&e) {
                    RetryDecision::GiveUp => {
                        debug!("{}: permanent failure, not retrying: {}", label, e);
                        return Attempted {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }
                    RetryDecision::Retry(hint) => hint,
                };
                if attempt >= max_attempts {
                    warn!("{}: giving up after {} attempts: {}", label, attempt, e);
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                let delay = policy.delay_for(attempt, hint);
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {}ms",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
