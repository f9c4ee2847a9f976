//! Bounded retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, cap)`
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    /// Retries used, not counting the first attempt
    pub retries_used: u32,
}

/// Run `op` until it succeeds or the policy is exhausted. Only the last error is kept.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    retries_used: attempt,
                }
            }
            Err(e) if attempt < policy.retries => {
                let delay = backoff_delay(attempt, policy.base, policy.cap);
                tracing::warn!(
                    attempt = attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                metrics::counter!(crate::api::metrics::PIPELINE_STEP_RETRIES_TOTAL).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Retried {
                    result: Err(e),
                    retries_used: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped_and_non_decreasing() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(30_000);
        let delays: Vec<u64> = (0..8)
            .map(|n| backoff_delay(n, base, cap).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(63, Duration::from_secs(1), cap), cap);
        assert_eq!(backoff_delay(u32::MAX, Duration::from_secs(1), cap), cap);
    }

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_retries_plus_one() {
        for retries in 0..4 {
            let calls = AtomicU32::new(0);
            let outcome: Retried<(), String> = retry_with_backoff(fast(retries), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }
            })
            .await;
            assert_eq!(calls.load(Ordering::SeqCst), retries + 1);
            assert_eq!(outcome.retries_used, retries);
            assert_eq!(outcome.result.unwrap_err(), "boom");
        }
    }

    #[tokio::test]
    async fn test_success_after_failures_reports_retries_used() {
        let outcome: Retried<u32, String> = retry_with_backoff(fast(5), |attempt| async move {
            if attempt < 2 {
                Err(format!("fail {}", attempt))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.retries_used, 2);
    }

    #[test]
    fn test_first_success_uses_no_retries() {
        let outcome: Retried<&str, String> =
            tokio_test::block_on(retry_with_backoff(fast(3), |_| async { Ok("done") }));
        tokio_test::assert_ok!(&outcome.result);
        assert_eq!(outcome.retries_used, 0);
    }

    #[tokio::test]
    async fn test_last_error_is_kept() {
        let outcome: Retried<(), String> =
            retry_with_backoff(fast(2), |attempt| async move { Err(format!("fail {}", attempt)) }).await;
        assert_eq!(outcome.result.unwrap_err(), "fail 2");
    }
}
