//! Infrastructure retry with capped exponential backoff.
//!
//! This is the innermost failure tier: transport errors, timeouts and rate
//! limits of delegated calls. It never touches a node's retry or rework
//! budget; when it gives up, the caller turns the last error into a
//! `NodeFailure::Infrastructure`.

use std::future::Future;
use std::time::Duration;

use pipeline::ports::Retryable;
use pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryBackoffConfig {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            backoff_factor: 1.0,
            max_delay_ms: 0,
            jitter: false,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_factor(attempt, jitter_seed);
    }
    delay.round().max(0.0) as u64
}

// Deterministic xorshift jitter in [0.5, 1.5).
fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ (u64::from(attempt) << 32) ^ 0x9E37_79B9_7F4A_7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
    0.5 + (r as f64) / (u64::MAX as f64)
}

fn seed_for(operation: &str) -> u64 {
    operation
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

/// The last error of an operation that was not retried further.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

/// Calls `operation` until it succeeds, returns a non-retryable error, or
/// `max_attempts` is reached. A `Retryable { after }` hint longer than the
/// computed backoff wins.
pub async fn retry_infrastructure<T, E, F, Fut>(
    config: &RetryBackoffConfig,
    operation: &str,
    mut call: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let seed = seed_for(operation);
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let hint = match error.retry_policy() {
                    RetryPolicy::Retryable { after } if attempt < max_attempts => after,
                    _ => return Err(RetryError { attempts: attempt, error }),
                };
                let backoff = Duration::from_millis(delay_for_attempt_ms(attempt, config, seed));
                let delay = hint.map_or(backoff, |after| after.max(backoff));
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying delegated call"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(RetryPolicy);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky")
        }
    }

    impl Retryable for Flaky {
        fn retry_policy(&self) -> RetryPolicy {
            self.0.clone()
        }
    }

    #[test]
    fn delay_for_attempt_ms_no_jitter_expected_capped_exponential() {
        let config = RetryBackoffConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 300,
            jitter: false,
        };
        assert_eq!(delay_for_attempt_ms(1, &config, 0), 100);
        assert_eq!(delay_for_attempt_ms(2, &config, 0), 200);
        assert_eq!(delay_for_attempt_ms(3, &config, 0), 300);
    }

    #[test]
    fn delay_for_attempt_ms_jitter_expected_deterministic_within_bounds() {
        let config = RetryBackoffConfig::default();
        let first = delay_for_attempt_ms(2, &config, 7);
        assert_eq!(first, delay_for_attempt_ms(2, &config, 7));
        assert!((200..=600).contains(&first));
    }

    #[tokio::test]
    async fn retry_infrastructure_transient_then_ok_expected_success() {
        let calls = AtomicU32::new(0);
        let result = retry_infrastructure(&RetryBackoffConfig::immediate(3), "generate", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Flaky(RetryPolicy::Retryable { after: None }))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.expect("third attempt succeeds"), 2);
    }

    #[tokio::test]
    async fn retry_infrastructure_non_retryable_expected_single_attempt() {
        let result: Result<(), _> =
            retry_infrastructure(&RetryBackoffConfig::immediate(5), "generate", |_| async {
                Err(Flaky(RetryPolicy::NonRetryable))
            })
            .await;
        assert_eq!(result.expect_err("fails").attempts, 1);
    }

    #[tokio::test]
    async fn retry_infrastructure_exhausted_expected_max_attempts() {
        let result: Result<(), _> =
            retry_infrastructure(&RetryBackoffConfig::immediate(4), "judge", |_| async {
                Err(Flaky(RetryPolicy::Retryable { after: None }))
            })
            .await;
        assert_eq!(result.expect_err("fails").attempts, 4);
    }
}
