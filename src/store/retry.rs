//! Bounded exponential backoff for transient database failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::DatabaseError;

/// Delay before retry number `attempt` (1-based): exponential growth capped at
/// `max_delay`, with the upper half randomized so that concurrent callers do
/// not retry in lockstep.
pub fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ceiling = policy
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(policy.max_delay_ms);
    let half = ceiling / 2;
    let jitter = if half > 0 {
        rand::thread_rng().gen_range(0..=half)
    } else {
        0
    };
    Duration::from_millis(ceiling - half + jitter)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only [`DatabaseError::is_transient`] failures are retried. Running out of
/// attempts yields [`DatabaseError::RetriesExhausted`] wrapping the last error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= max_attempts {
                    warn!(operation, attempts = attempt, error = %e, "Giving up on transient failure");
                    return Err(DatabaseError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                let delay = backoff_delay(policy, attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient database failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bound `fut` by `limit`, surfacing [`DatabaseError::Timeout`] when it fires.
///
/// Dropping the future aborts the in-flight call; anything the database
/// already committed stays committed.
pub async fn with_timeout<T, Fut>(limit: Option<Duration>, fut: Fut) -> Result<T, DatabaseError>
where
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DatabaseError::Timeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        for _ in 0..50 {
            let first = backoff_delay(&policy, 1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let third = backoff_delay(&policy, 3);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));
            let late = backoff_delay(&policy, 30);
            assert!(late >= Duration::from_millis(500) && late <= Duration::from_millis(1_000));
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&fast_policy(3), "test", || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(DatabaseError::Connection("reset".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_surfaces_retryable_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(&fast_policy(3), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DatabaseError::Connection("refused".into()))
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, DatabaseError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(&fast_policy(5), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DatabaseError::Constraint("duplicate key".into()))
        })
        .await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_fires() {
        let result: Result<(), _> = with_timeout(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DatabaseError::Timeout(_))));

        let ok = with_timeout(None, async { Ok::<_, DatabaseError>(5) }).await;
        assert_eq!(ok.unwrap(), 5);
    }
}
