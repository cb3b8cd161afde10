//! Bounded exponential backoff, shared by the ingestor's publish retry and
//! the DLQ writer's retry. Retries are always bounded and explicit — no
//! component retries silently forever.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// start 100 ms, factor 2, cap 10 s, max 5 attempts.
    pub const fn publish_retry() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Retries `op` up to `policy.max_attempts` times with exponential
/// backoff between attempts. Returns the last error once attempts are
/// exhausted.
pub async fn retry<F, Fut, T, E>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let p = BackoffPolicy::publish_retry();
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retry_exhausts_after_max_attempts() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            factor: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: 3,
        };
        let mut calls = 0;
        let result: Result<(), &str> = retry(&policy, |_attempt| {
            calls += 1;
            async { Err("boom") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_succeeds_before_exhaustion() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            factor: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: 5,
        };
        let mut calls = 0;
        let result = retry(&policy, |_attempt| {
            calls += 1;
            async move {
                if calls < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 2);
    }
}
