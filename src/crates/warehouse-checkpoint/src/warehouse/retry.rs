//! Retry policy for warehouse statements
//!
//! Exponential backoff with jitter around any [`WarehouseClient`]. Only errors that
//! report [`WarehouseError::is_retryable`] are retried; everything else, including
//! conflicts, surfaces on the first attempt.

use super::{ResultSet, SqlDialect, Statement, WarehouseClient};
use crate::error::Result;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retrying failed statements
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a policy with the given max attempts
    ///
    /// ```rust
    /// use warehouse_checkpoint::warehouse::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(3);
    /// assert_eq!(policy.max_attempts, 3);
    /// ```
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 30.0,
            jitter: true,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows attempt `attempt` (0-indexed)
    ///
    /// `initial_interval * backoff_factor^attempt`, capped at `max_interval`, then
    /// scaled by a random factor in `0.5..=1.5` when jitter is on.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval).max(0.0);
        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if !error.is_retryable() || !policy.should_retry(attempt) {
                    return Err(error);
                }

                let delay = policy.calculate_delay(attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "Transient warehouse failure, retrying: {}",
                    error
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// A [`WarehouseClient`] that resubmits statements failing with transient errors
///
/// Resubmission is only safe for statements whose effect is idempotent by row
/// identity. Guarded inserts are idempotent in effect but a retried one may report
/// zero inserted rows after its first attempt committed; the checkpoint saver
/// handles that by re-reading the row on conflict.
#[derive(Debug, Clone)]
pub struct RetryingWarehouse<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: WarehouseClient> RetryingWarehouse<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

#[async_trait]
impl<C: WarehouseClient> WarehouseClient for RetryingWarehouse<C> {
    fn dialect(&self) -> SqlDialect {
        self.inner.dialect()
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        with_retry(&self.policy, || self.inner.execute(statement)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WarehouseError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(100.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0).as_secs_f64(), 1.0);
        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 2.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 8.0);
        assert_eq!(policy.calculate_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(10.0)
            .with_max_interval(50.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(5).as_secs_f64(), 50.0);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5).with_initial_interval(1.0);
        for _ in 0..20 {
            let delay = policy.calculate_delay(1).as_secs_f64();
            assert!((1.0..=3.0).contains(&delay));
        }
    }

    struct Flaky {
        failures: usize,
        calls: Arc<AtomicUsize>,
        error: fn() -> WarehouseError,
    }

    #[async_trait]
    impl WarehouseClient for Flaky {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::Sqlite
        }

        async fn execute(&self, _statement: &Statement) -> Result<ResultSet> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(ResultSet::empty())
            }
        }
    }

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .with_initial_interval(0.001)
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = RetryingWarehouse::new(
            Flaky {
                failures: 2,
                calls: calls.clone(),
                error: || WarehouseError::Unavailable("429".into()),
            },
            fast_policy(3),
        );

        client.execute(&Statement::new("test", "SELECT 1")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = RetryingWarehouse::new(
            Flaky {
                failures: 10,
                calls: calls.clone(),
                error: || WarehouseError::Unavailable("503".into()),
            },
            fast_policy(2),
        );

        let err = client.execute(&Statement::new("test", "SELECT 1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backend_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = RetryingWarehouse::new(
            Flaky {
                failures: 1,
                calls: calls.clone(),
                error: || WarehouseError::Backend("syntax error".into()),
            },
            fast_policy(5),
        );

        assert!(client.execute(&Statement::new("test", "SELEC 1")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
