//! Bounded exponential backoff for transient failures, built on `backon`.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use log::warn;

use crate::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn uploads(config: &SchedulerConfig) -> Self {
        RetryPolicy {
            max_retries: config.upload_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
            ..Default::default()
        }
    }

    /// No retries; used where a single attempt is wanted, e.g. tests.
    #[cfg(test)]
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            factor: 1.0,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay.max(self.initial_delay))
            .with_max_times(self.max_retries as usize)
            .with_factor(self.factor.max(1.0))
            .with_jitter()
    }
}

/// Runs `operation` until it succeeds, `is_retryable` rejects the error, or
/// the policy is exhausted. The last error is returned.
pub async fn retry_async<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_retries = policy.max_retries;
    let mut attempt = 0u32;
    let notify = |err: &E, delay: Duration| {
        attempt += 1;
        warn!(
            "{} failed (attempt {}/{}), retrying in {} ms: {}",
            operation_name,
            attempt,
            max_retries,
            delay.as_millis(),
            err
        );
    };

    operation
        .retry(policy.backoff())
        .when(is_retryable)
        .notify(notify)
        .await
}
